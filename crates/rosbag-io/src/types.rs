use std::{collections::BTreeMap, io, path::PathBuf};

use thiserror::Error;

/// ROS type name of raw camera images.
pub const IMAGE_TYPE: &str = "sensor_msgs/msg/Image";
/// ROS type name of compressed camera images.
pub const COMPRESSED_IMAGE_TYPE: &str = "sensor_msgs/msg/CompressedImage";

/// Topic name mapped to the verbatim `offered_qos_profiles` string of the source bag.
pub type QosProfileMap = BTreeMap<String, String>;

/// Decoded image in canonical BGR8 layout, row-major and tightly packed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, BagError> {
        let expected = Self::expected_len(width, height);
        if data.len() != expected {
            return Err(BagError::FrameSize {
                width,
                height,
                actual: data.len(),
                expected,
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Uniformly coloured frame, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(Self::expected_len(width, height))
            .collect();
        Self {
            data,
            width,
            height,
        }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.data[idx..idx + 3].copy_from_slice(&bgr);
    }
}

/// How an image message travels on its topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageTransport {
    Raw,
    Compressed,
}

impl ImageTransport {
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        match type_name {
            IMAGE_TYPE => Some(Self::Raw),
            COMPRESSED_IMAGE_TYPE => Some(Self::Compressed),
            _ => None,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Self::Raw => IMAGE_TYPE,
            Self::Compressed => COMPRESSED_IMAGE_TYPE,
        }
    }
}

/// A serialized message read from a bag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BagMessage {
    pub topic: String,
    pub type_name: String,
    /// Receive time in nanoseconds.
    pub timestamp: i64,
    /// CDR payload, exactly as stored.
    pub data: Vec<u8>,
}

impl BagMessage {
    pub fn transport(&self) -> Option<ImageTransport> {
        ImageTransport::from_type_name(&self.type_name)
    }

    pub fn is_image(&self) -> bool {
        self.transport().is_some()
    }
}

/// Topic metadata as declared in the `topics` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub type_name: String,
    pub serialization_format: String,
    pub offered_qos_profiles: String,
}

#[derive(Debug, Error)]
pub enum BagError {
    #[error("bag not found at {path:?}")]
    NotFound { path: PathBuf },
    #[error("no .db3 storage files in {path:?}")]
    NoStorageFiles { path: PathBuf },
    #[error("output bag {path:?} already exists")]
    AlreadyExists { path: PathBuf },
    #[error("unsupported storage identifier {0:?} (only \"sqlite3\" is available)")]
    UnsupportedStorage(String),
    #[error("unsupported pixel encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("topic {0:?} has no QoS profile in the source bag")]
    MissingQosProfile(String),
    #[error("topic {topic:?} already registered as {existing}, cannot write {requested}")]
    TopicTypeMismatch {
        topic: String,
        existing: String,
        requested: String,
    },
    #[error("message references unknown topic id {0}")]
    UnknownTopicId(i64),
    #[error("malformed CDR payload: {0}")]
    Cdr(String),
    #[error("frame {width}x{height} needs {expected} bytes, got {actual}")]
    FrameSize {
        width: u32,
        height: u32,
        actual: usize,
        expected: usize,
    },
    #[error("malformed bag metadata: {0}")]
    Metadata(#[from] serde_yaml::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
