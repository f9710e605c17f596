//! Model-side building blocks for the anonymizer: the detection data model,
//! the detector and segmenter seams, and their ONNX Runtime implementations.
//!
//! Frames arrive as borrowed [`BgrImage`] views so this crate stays
//! independent of how they were decoded.

mod detection;
mod detector;
mod device;
mod error;
mod segmenter;

pub use detection::{BgrImage, BoundingBox, Detection, Mask, PixelRect};
pub use detector::{Letterbox, ObjectDetector, YoloDetector};
pub use device::Device;
pub use error::InferenceError;
pub use segmenter::{MaskRefiner, SamSegmenter};
