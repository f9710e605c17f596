//! Append-only writer producing a rosbag2 `sqlite3` bag.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::{
    encoding::PixelEncoding,
    messages::{CompressedImage, CompressionFormat, Header, RawImage},
    metadata::{
        BagDuration, BagMetadata, BagTime, FileMetadata, METADATA_VERSION, TopicMetadata,
        TopicWithCount,
    },
    types::{BagError, Frame, ImageTransport, QosProfileMap},
};

pub const SQLITE3_STORAGE_ID: &str = "sqlite3";
const SERIALIZATION_FORMAT: &str = "cdr";
const COMMIT_INTERVAL: usize = 1_000;
const STAGING_SUFFIX: &str = ".partial";

const SCHEMA: &str = "
CREATE TABLE topics(
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    serialization_format TEXT NOT NULL,
    offered_qos_profiles TEXT NOT NULL
);
CREATE TABLE messages(
    id INTEGER PRIMARY KEY,
    topic_id INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    data BLOB NOT NULL
);
CREATE INDEX timestamp_idx ON messages (timestamp ASC);
";

#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Write every image as a JPEG `CompressedImage`, whatever its source transport.
    pub compress_images: bool,
    pub storage_id: String,
    pub jpeg_quality: u8,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compress_images: false,
            storage_id: SQLITE3_STORAGE_ID.to_string(),
            jpeg_quality: 95,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteSummary {
    pub path: PathBuf,
    pub messages: u64,
    pub topics: usize,
}

struct RegisteredTopic {
    id: i64,
    type_name: String,
    qos: String,
    messages: u64,
}

pub struct BagWriter {
    path: PathBuf,
    staging: PathBuf,
    storage_file: String,
    conn: Connection,
    options: WriterOptions,
    qos_profiles: QosProfileMap,
    topics: HashMap<String, RegisteredTopic>,
    pending: usize,
    messages_written: u64,
    /// Earliest and latest timestamp written.
    time_span: Option<(i64, i64)>,
}

impl BagWriter {
    /// Create a new bag that will appear at `path` once [`finish`](Self::finish) succeeds.
    ///
    /// Rows go to a `<path>.partial` staging directory first, so an aborted
    /// run never leaves a truncated bag at `path`. Topics are registered
    /// up front with [`register_topic`](Self::register_topic) or lazily on
    /// first write, and must appear in `qos_profiles`.
    pub fn create(
        path: impl AsRef<Path>,
        options: WriterOptions,
        qos_profiles: QosProfileMap,
    ) -> Result<Self, BagError> {
        if options.storage_id != SQLITE3_STORAGE_ID {
            return Err(BagError::UnsupportedStorage(options.storage_id));
        }
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(BagError::AlreadyExists { path });
        }
        let staging = staging_path(&path);
        if staging.exists() {
            warn!("removing stale staging directory {}", staging.display());
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let stem = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rosbag2".to_string());
        let storage_file = format!("{stem}_0.db3");
        let db_path = staging.join(&storage_file);
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = MEMORY; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch("BEGIN")?;
        debug!("created bag storage {}", db_path.display());

        Ok(Self {
            path,
            staging,
            storage_file,
            conn,
            options,
            qos_profiles,
            topics: HashMap::new(),
            pending: 0,
            messages_written: 0,
            time_span: None,
        })
    }

    /// Final location of the bag.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory rows are written to until the bag is finished.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn messages_written(&self) -> u64 {
        self.messages_written
    }

    /// Write an already serialized payload unchanged.
    pub fn write_any(
        &mut self,
        data: &[u8],
        type_name: &str,
        topic: &str,
        timestamp: i64,
    ) -> Result<(), BagError> {
        let topic_id = self.register_topic(topic, type_name)?;
        self.conn
            .prepare_cached("INSERT INTO messages (topic_id, timestamp, data) VALUES (?1, ?2, ?3)")?
            .execute(params![topic_id, timestamp, data])?;
        if let Some(registered) = self.topics.get_mut(topic) {
            registered.messages += 1;
        }
        self.time_span = Some(match self.time_span {
            Some((first, last)) => (first.min(timestamp), last.max(timestamp)),
            None => (timestamp, timestamp),
        });
        self.messages_written += 1;
        self.pending += 1;
        if self.pending >= COMMIT_INTERVAL {
            self.conn.execute_batch("COMMIT; BEGIN")?;
            self.pending = 0;
        }
        Ok(())
    }

    /// Serialize `frame` as an image message.
    ///
    /// Without an `encoding`, or when the writer compresses images, the frame
    /// becomes a JPEG `CompressedImage`; otherwise a raw `Image` in `encoding`.
    pub fn write_image(
        &mut self,
        frame: &Frame,
        header: Header,
        topic: &str,
        timestamp: i64,
        encoding: Option<PixelEncoding>,
    ) -> Result<ImageTransport, BagError> {
        let (transport, payload) = match encoding {
            Some(encoding) if !self.options.compress_images => (
                ImageTransport::Raw,
                RawImage::from_frame(frame, header, encoding).to_cdr(),
            ),
            _ => (
                ImageTransport::Compressed,
                CompressedImage::from_frame(
                    frame,
                    header,
                    CompressionFormat::Jpeg,
                    self.options.jpeg_quality,
                )?
                .to_cdr(),
            ),
        };
        self.write_any(&payload, transport.type_name(), topic, timestamp)?;
        Ok(transport)
    }

    /// Write a raw image message as given, pixel data untouched.
    pub fn write_raw(
        &mut self,
        image: &RawImage,
        topic: &str,
        timestamp: i64,
    ) -> Result<(), BagError> {
        self.write_any(&image.to_cdr(), ImageTransport::Raw.type_name(), topic, timestamp)
    }

    /// Index describing what has been written so far.
    pub fn metadata(&self) -> BagMetadata {
        let (first, last) = self.time_span.unwrap_or((0, 0));
        let starting_time = BagTime {
            nanoseconds_since_epoch: first,
        };
        let duration = BagDuration {
            nanoseconds: last - first,
        };
        let mut topics: Vec<(&String, &RegisteredTopic)> = self.topics.iter().collect();
        topics.sort_by_key(|(_, registered)| registered.id);

        BagMetadata {
            version: METADATA_VERSION,
            storage_identifier: SQLITE3_STORAGE_ID.to_string(),
            duration,
            starting_time,
            message_count: self.messages_written,
            topics_with_message_count: topics
                .into_iter()
                .map(|(name, registered)| TopicWithCount {
                    topic_metadata: TopicMetadata {
                        name: name.clone(),
                        type_name: registered.type_name.clone(),
                        serialization_format: SERIALIZATION_FORMAT.to_string(),
                        offered_qos_profiles: registered.qos.clone(),
                    },
                    message_count: registered.messages,
                })
                .collect(),
            compression_format: String::new(),
            compression_mode: String::new(),
            relative_file_paths: vec![self.storage_file.clone()],
            files: vec![FileMetadata {
                path: self.storage_file.clone(),
                starting_time,
                duration,
                message_count: self.messages_written,
            }],
        }
    }

    /// Commit outstanding rows, close the storage file, write `metadata.yaml`
    /// and move the bag into place.
    pub fn finish(self) -> Result<WriteSummary, BagError> {
        self.conn.execute_batch("COMMIT")?;
        let summary = WriteSummary {
            path: self.path.clone(),
            messages: self.messages_written,
            topics: self.topics.len(),
        };
        let metadata = self.metadata();
        self.conn.close().map_err(|(_, err)| BagError::Sqlite(err))?;
        metadata.save(&self.staging)?;
        fs::rename(&self.staging, &self.path)?;
        debug!("bag committed to {}", self.path.display());
        Ok(summary)
    }

    /// Declare `topic` with its QoS from the source map, returning its row id.
    ///
    /// Registering a topic that exists with the same type is a no-op, so
    /// topics that never receive a message still appear in the output.
    pub fn register_topic(&mut self, topic: &str, type_name: &str) -> Result<i64, BagError> {
        if let Some(existing) = self.topics.get(topic) {
            if existing.type_name != type_name {
                return Err(BagError::TopicTypeMismatch {
                    topic: topic.to_string(),
                    existing: existing.type_name.clone(),
                    requested: type_name.to_string(),
                });
            }
            return Ok(existing.id);
        }

        let qos = self
            .qos_profiles
            .get(topic)
            .ok_or_else(|| BagError::MissingQosProfile(topic.to_string()))?
            .clone();
        let id = self.topics.len() as i64 + 1;
        self.conn.execute(
            "INSERT INTO topics (id, name, type, serialization_format, offered_qos_profiles) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, topic, type_name, SERIALIZATION_FORMAT, qos],
        )?;
        self.topics.insert(
            topic.to_string(),
            RegisteredTopic {
                id,
                type_name: type_name.to_string(),
                qos,
                messages: 0,
            },
        );
        debug!("registered topic {topic} ({type_name})");
        Ok(id)
    }
}

/// `<path>.partial`, the directory a bag is staged in before it is finished.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}
