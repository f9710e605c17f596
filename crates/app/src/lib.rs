//! Rosbag image anonymizer.
//!
//! Reads a rosbag2 bag, blurs the regions an object detector flags in every
//! `sensor_msgs/msg/Image` and `sensor_msgs/msg/CompressedImage` message, and
//! writes a new bag in which all other messages are byte-for-byte copies.
//!
//! The crate is split into focused modules:
//! - `config`: TOML configuration, CLI overrides and validation.
//! - `classes`: class names for debug counts and labels.
//! - `blur`: Gaussian blur over box or mask regions.
//! - `pipeline`: the per-message passthrough / transform loop.
//! - `annotation`: debug preview drawing.
//! - `telemetry`: tracing subscribers and the Prometheus recorder.

pub mod annotation;
pub mod blur;
pub mod classes;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod telemetry;

pub use blur::{BlurCoverage, RegionPolicy, blur};
pub use classes::ClassList;
pub use config::{AnonymizerConfig, CliArgs, ConfigFile, TelemetryOptions};
pub use error::PipelineError;
pub use pipeline::{Anonymizer, ProcessedFrame, RunSummary};
