use ml_core::InferenceError;
use rosbag_io::BagError;
use thiserror::Error;

/// Failures that abort an anonymization run.
///
/// There is no per-frame recovery: the first error stops the loop and the
/// output stays in its staging directory.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported pixel encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("model inference failed: {0}")]
    ModelInference(#[source] InferenceError),
    #[error("segmentation failed for detection #{index}: {reason}")]
    Segmentation { index: usize, reason: String },
    #[error("bag I/O failed: {0}")]
    Io(#[source] BagError),
    #[error("blur failed: {0}")]
    Blur(String),
    #[error("blur region \"mask\" needs a segmenter, none was provided")]
    MissingSegmenter,
}

impl From<BagError> for PipelineError {
    fn from(err: BagError) -> Self {
        match err {
            BagError::UnsupportedEncoding(encoding) => Self::UnsupportedEncoding(encoding),
            other => Self::Io(other),
        }
    }
}

impl From<InferenceError> for PipelineError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Segmentation { index, reason } => Self::Segmentation { index, reason },
            other => Self::ModelInference(other),
        }
    }
}
