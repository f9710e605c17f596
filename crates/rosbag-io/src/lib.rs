//! rosbag2 storage access for the anonymizer.
//!
//! ```text
//! ┌──────────────┐   BagMessage    ┌────────────┐   Frame (BGR8)
//! │  BagReader   │────────────────▶│ messages:: │──────────────▶ pipeline
//! │ (sqlite3)    │                 │ decode     │
//! └──────────────┘                 └────────────┘
//!                                                  Frame + Header
//! ┌──────────────┐  write_any / write_image       ◀────────────── pipeline
//! │  BagWriter   │◀───────────────────────────────
//! └──────────────┘
//! ```
//!
//! Payloads stay CDR-encoded end to end; only `sensor_msgs/msg/Image` and
//! `sensor_msgs/msg/CompressedImage` are ever decoded.

mod cdr;
pub mod encoding;
pub mod messages;
pub mod metadata;
pub mod reader;
pub mod types;
pub mod writer;

pub use encoding::PixelEncoding;
pub use messages::{
    CompressedImage, CompressionFormat, Header, ImageSource, RawImage, decode_image,
    frame_to_rgb_image, rgb_image_to_frame,
};
pub use metadata::{BagMetadata, METADATA_FILE};
pub use reader::{BagReader, Messages};
pub use types::{
    BagError, BagMessage, COMPRESSED_IMAGE_TYPE, Frame, IMAGE_TYPE, ImageTransport,
    QosProfileMap, TopicInfo,
};
pub use writer::{BagWriter, SQLITE3_STORAGE_ID, WriteSummary, WriterOptions, staging_path};
