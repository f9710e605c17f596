//! `metadata.yaml`, the index `ros2 bag` reads before opening any storage file.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::types::BagError;

pub const METADATA_FILE: &str = "metadata.yaml";
/// Layout version written by this crate; version 5 introduced per-file entries.
pub const METADATA_VERSION: u32 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDocument {
    rosbag2_bagfile_information: BagMetadata,
}

/// Contents of `rosbag2_bagfile_information`.
///
/// Fields missing from older bags deserialize to their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BagMetadata {
    pub version: u32,
    pub storage_identifier: String,
    pub duration: BagDuration,
    pub starting_time: BagTime,
    pub message_count: u64,
    pub topics_with_message_count: Vec<TopicWithCount>,
    pub compression_format: String,
    pub compression_mode: String,
    /// Storage files in playback order, relative to the bag directory.
    pub relative_file_paths: Vec<String>,
    pub files: Vec<FileMetadata>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagDuration {
    pub nanoseconds: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagTime {
    pub nanoseconds_since_epoch: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicWithCount {
    pub topic_metadata: TopicMetadata,
    pub message_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub serialization_format: String,
    #[serde(default)]
    pub offered_qos_profiles: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub starting_time: BagTime,
    pub duration: BagDuration,
    pub message_count: u64,
}

impl BagMetadata {
    /// Read `<dir>/metadata.yaml`, or `None` when the bag has none.
    pub fn load(dir: &Path) -> Result<Option<Self>, BagError> {
        let path = dir.join(METADATA_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let document: MetadataDocument = serde_yaml::from_str(&text)?;
        Ok(Some(document.rosbag2_bagfile_information))
    }

    pub fn save(&self, dir: &Path) -> Result<(), BagError> {
        let document = MetadataDocument {
            rosbag2_bagfile_information: self.clone(),
        };
        fs::write(dir.join(METADATA_FILE), serde_yaml::to_string(&document)?)?;
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Option<&TopicWithCount> {
        self.topics_with_message_count
            .iter()
            .find(|entry| entry.topic_metadata.name == name)
    }
}
