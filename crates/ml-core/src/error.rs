use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    /// ONNX Runtime refused to load or run a model.
    #[error("model runtime error: {0}")]
    Model(String),
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    /// The segmenter could not turn detection `index` into a mask.
    #[error("segmentation failed for detection #{index}: {reason}")]
    Segmentation { index: usize, reason: String },
    #[error("unknown execution device {0:?} (expected cpu, cuda or cuda:<id>)")]
    UnknownDevice(String),
}

pub(crate) fn model_error(err: impl std::fmt::Display) -> InferenceError {
    InferenceError::Model(err.to_string())
}
