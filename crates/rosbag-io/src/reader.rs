//! Sequential reader over rosbag2 `sqlite3` storage.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::debug;

use crate::{
    metadata::BagMetadata,
    types::{BagError, BagMessage, QosProfileMap, TopicInfo},
};

const PAGE_SIZE: i64 = 256;

struct StorageFile {
    path: PathBuf,
    conn: Connection,
    /// topic id → (name, type)
    topics_by_id: HashMap<i64, (String, String)>,
}

/// Read-only view of a bag directory (or a single `.db3` file).
pub struct BagReader {
    path: PathBuf,
    files: Vec<StorageFile>,
    topics: Vec<TopicInfo>,
    qos_profiles: QosProfileMap,
    metadata: Option<BagMetadata>,
}

impl BagReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BagError> {
        let path = path.as_ref().to_path_buf();
        let metadata = if path.is_dir() {
            BagMetadata::load(&path)?
        } else {
            None
        };
        let storage_paths = storage_files(&path, metadata.as_ref())?;

        let mut files = Vec::with_capacity(storage_paths.len());
        let mut topics: Vec<TopicInfo> = Vec::new();
        let mut qos_profiles = QosProfileMap::new();

        for storage_path in storage_paths {
            let conn = Connection::open_with_flags(
                &storage_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            let declared = read_topics(&conn)?;
            let mut topics_by_id = HashMap::with_capacity(declared.len());
            for (id, mut info) in declared {
                if info.offered_qos_profiles.is_empty() {
                    if let Some(entry) = metadata.as_ref().and_then(|m| m.topic(&info.name)) {
                        info.offered_qos_profiles =
                            entry.topic_metadata.offered_qos_profiles.clone();
                    }
                }
                topics_by_id.insert(id, (info.name.clone(), info.type_name.clone()));
                if !qos_profiles.contains_key(&info.name) {
                    qos_profiles.insert(info.name.clone(), info.offered_qos_profiles.clone());
                    topics.push(info);
                }
            }
            debug!(
                "opened storage {} ({} topic(s))",
                storage_path.display(),
                topics_by_id.len()
            );
            files.push(StorageFile {
                path: storage_path,
                conn,
                topics_by_id,
            });
        }

        Ok(Self {
            path,
            files,
            topics,
            qos_profiles,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn storage_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|file| file.path.as_path())
    }

    /// The bag's `metadata.yaml`, when it has one.
    pub fn metadata(&self) -> Option<&BagMetadata> {
        self.metadata.as_ref()
    }

    pub fn topics(&self) -> &[TopicInfo] {
        &self.topics
    }

    /// QoS profiles exactly as offered by the recorder, keyed by topic.
    pub fn qos_profile_map(&self) -> &QosProfileMap {
        &self.qos_profiles
    }

    pub fn message_count(&self) -> Result<u64, BagError> {
        let mut total = 0u64;
        for file in &self.files {
            let count: i64 =
                file.conn
                    .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Earliest message recorded on `topic`, if any.
    pub fn first_message(&self, topic: &str) -> Result<Option<BagMessage>, BagError> {
        for file in &self.files {
            let Some((&id, (name, type_name))) = file
                .topics_by_id
                .iter()
                .find(|(_, (name, _))| name == topic)
            else {
                continue;
            };
            let row = file
                .conn
                .query_row(
                    "SELECT timestamp, data FROM messages WHERE topic_id = ?1 \
                     ORDER BY timestamp, id LIMIT 1",
                    params![id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )
                .optional()?;
            if let Some((timestamp, data)) = row {
                return Ok(Some(BagMessage {
                    topic: name.clone(),
                    type_name: type_name.clone(),
                    timestamp,
                    data,
                }));
            }
        }
        Ok(None)
    }

    /// Iterate every message in `(timestamp, id)` order, file by file.
    pub fn messages(&self) -> Messages<'_> {
        Messages {
            reader: self,
            file_idx: 0,
            cursor: None,
            page: VecDeque::new(),
        }
    }
}

impl<'a> IntoIterator for &'a BagReader {
    type Item = Result<BagMessage, BagError>;
    type IntoIter = Messages<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages()
    }
}

/// Paged message iterator returned by [`BagReader::messages`].
pub struct Messages<'a> {
    reader: &'a BagReader,
    file_idx: usize,
    /// Last (timestamp, id) yielded from the current file.
    cursor: Option<(i64, i64)>,
    page: VecDeque<BagMessage>,
}

impl Messages<'_> {
    fn fetch_page(&mut self) -> Result<usize, BagError> {
        let reader = self.reader;
        let file = &reader.files[self.file_idx];
        let mut rows: Vec<(i64, i64, i64, Vec<u8>)> = Vec::with_capacity(PAGE_SIZE as usize);
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        };
        match self.cursor {
            None => {
                let mut stmt = file.conn.prepare_cached(
                    "SELECT id, topic_id, timestamp, data FROM messages \
                     ORDER BY timestamp, id LIMIT ?1",
                )?;
                for row in stmt.query_map(params![PAGE_SIZE], map_row)? {
                    rows.push(row?);
                }
            }
            Some((timestamp, id)) => {
                let mut stmt = file.conn.prepare_cached(
                    "SELECT id, topic_id, timestamp, data FROM messages \
                     WHERE timestamp > ?1 OR (timestamp = ?1 AND id > ?2) \
                     ORDER BY timestamp, id LIMIT ?3",
                )?;
                for row in stmt.query_map(params![timestamp, id, PAGE_SIZE], map_row)? {
                    rows.push(row?);
                }
            }
        }

        let fetched = rows.len();
        for (id, topic_id, timestamp, data) in rows {
            let (topic, type_name) = file
                .topics_by_id
                .get(&topic_id)
                .ok_or(BagError::UnknownTopicId(topic_id))?;
            self.cursor = Some((timestamp, id));
            self.page.push_back(BagMessage {
                topic: topic.clone(),
                type_name: type_name.clone(),
                timestamp,
                data,
            });
        }
        Ok(fetched)
    }
}

impl Iterator for Messages<'_> {
    type Item = Result<BagMessage, BagError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.page.pop_front() {
                return Some(Ok(message));
            }
            if self.file_idx >= self.reader.files.len() {
                return None;
            }
            match self.fetch_page() {
                Ok(0) => {
                    self.file_idx += 1;
                    self.cursor = None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.file_idx = self.reader.files.len();
                    self.page.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Storage files in playback order.
///
/// `relative_file_paths` of the metadata decides the order when present;
/// otherwise splits sort on their numeric `_<n>` suffix.
fn storage_files(path: &Path, metadata: Option<&BagMetadata>) -> Result<Vec<PathBuf>, BagError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(BagError::NotFound {
            path: path.to_path_buf(),
        });
    }
    if let Some(listed) = metadata
        .map(|m| &m.relative_file_paths)
        .filter(|paths| !paths.is_empty())
    {
        return listed
            .iter()
            .map(|relative| resolve_listed(path, relative))
            .collect();
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.extension().is_some_and(|ext| ext == "db3") {
            files.push(entry_path);
        }
    }
    if files.is_empty() {
        return Err(BagError::NoStorageFiles {
            path: path.to_path_buf(),
        });
    }
    files.sort_by_cached_key(|file| (split_index(file), file.clone()));
    Ok(files)
}

fn resolve_listed(dir: &Path, relative: &str) -> Result<PathBuf, BagError> {
    let direct = dir.join(relative);
    if direct.is_file() {
        return Ok(direct);
    }
    // Early recorders listed paths with the bag directory as prefix.
    if let Some(prefixed) = dir.parent().map(|parent| parent.join(relative)) {
        if prefixed.is_file() {
            return Ok(prefixed);
        }
    }
    Err(BagError::NotFound { path: direct })
}

/// `n` of a `<name>_<n>.db3` split.
fn split_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('_')?.1.parse().ok()
}

fn read_topics(conn: &Connection) -> Result<Vec<(i64, TopicInfo)>, BagError> {
    let mut stmt = match conn.prepare(
        "SELECT id, name, type, serialization_format, offered_qos_profiles \
         FROM topics ORDER BY id",
    ) {
        Ok(stmt) => stmt,
        // Bags recorded before QoS profiles were stored lack the column.
        Err(_) => conn.prepare(
            "SELECT id, name, type, serialization_format, '' FROM topics ORDER BY id",
        )?,
    };
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            TopicInfo {
                name: row.get(1)?,
                type_name: row.get(2)?,
                serialization_format: row.get(3)?,
                offered_qos_profiles: row.get(4)?,
            },
        ))
    })?;
    let mut topics = Vec::new();
    for row in rows {
        topics.push(row?);
    }
    Ok(topics)
}
