use std::{fmt, str::FromStr};

use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch},
    session::{Session, builder::GraphOptimizationLevel},
};
use tracing::debug;

use crate::error::{InferenceError, model_error};

/// Where model inference runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl FromStr for Device {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| InferenceError::UnknownDevice(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl Device {
    fn execution_provider(self) -> ExecutionProviderDispatch {
        match self {
            Self::Cpu => CPUExecutionProvider::default().build(),
            Self::Cuda(id) => CUDAExecutionProvider::default()
                .with_device_id(id as i32)
                .build()
                .error_on_failure(),
        }
    }

    /// Build an ONNX Runtime session for `model_path` on this device.
    pub(crate) fn load_session(self, model_path: &std::path::Path) -> Result<Session, InferenceError> {
        if !model_path.is_file() {
            return Err(InferenceError::Model(format!(
                "model file {} does not exist",
                model_path.display()
            )));
        }
        let session = Session::builder()
            .map_err(model_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_error)?
            .with_execution_providers([self.execution_provider()])
            .map_err(model_error)?
            .commit_from_file(model_path)
            .map_err(model_error)?;
        debug!("loaded {} on {self}", model_path.display());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_identifiers() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let device = Device::Cuda(1);
        assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
    }
}
