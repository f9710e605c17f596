//! Configuration parsing for the anonymizer.
//!
//! A TOML file is read into [`ConfigFile`], CLI flags override a few of its
//! fields, and [`AnonymizerConfig::validate`] turns the result into the
//! immutable configuration every stage reads.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use ml_core::Device;
use rosbag_io::{SQLITE3_STORAGE_ID, WriterOptions};
use serde::Deserialize;

use crate::{blur::RegionPolicy, classes::ClassList};

/// Raw configuration file as written by the user.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub detector: DetectorConfig,
    #[serde(default)]
    pub segmentation: Option<SegmentationConfig>,
    #[serde(default = "default_device")]
    pub device: String,
    pub rosbag: RosbagConfig,
    #[serde(default)]
    pub blur: BlurConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// ONNX detector weights.
    pub model: PathBuf,
    /// Detections scoring below this are dropped.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Class list file, `names = [...]`.
    pub class_config: PathBuf,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    /// Square detector input side in pixels.
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SegmentationConfig {
    pub encoder_model: PathBuf,
    pub decoder_model: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RosbagConfig {
    pub input_bag_path: PathBuf,
    pub output_bag_path: PathBuf,
    /// Write every image as a JPEG `CompressedImage`.
    #[serde(default)]
    pub output_save_compressed_image: bool,
    #[serde(default = "default_storage_id")]
    pub output_storage_id: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BlurConfig {
    #[serde(default)]
    pub region: RegionPolicy,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: u32,
    /// Gaussian sigma; `<= 0` derives it from the kernel size.
    #[serde(default = "default_sigma")]
    pub sigma_x: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default)]
    pub print_on_terminal: bool,
    #[serde(default)]
    pub show_on_image: bool,
    #[serde(default = "default_preview_path")]
    pub preview_path: PathBuf,
}

/// Optional telemetry outputs, set from the command line only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing run and frame spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Write the Prometheus metrics snapshot here when the run ends.
    pub metrics_out: Option<PathBuf>,
}

/// Validated configuration shared by every stage of a run.
#[derive(Clone, Debug, Default)]
pub struct AnonymizerConfig {
    pub detector: DetectorConfig,
    pub classes: ClassList,
    pub segmentation: Option<SegmentationConfig>,
    pub device: Device,
    pub rosbag: RosbagConfig,
    pub blur: BlurConfig,
    pub debug: DebugConfig,
    pub telemetry: TelemetryOptions,
}

/// Command line of the `rosbag2-anonymizer` binary.
#[derive(Debug, Parser)]
#[command(name = "rosbag2-anonymizer", version, about)]
pub struct CliArgs {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// Source bag (overrides `rosbag.input_bag_path`).
    #[arg(long = "input", value_name = "BAG")]
    pub input: Option<PathBuf>,
    /// Destination bag (overrides `rosbag.output_bag_path`).
    #[arg(long = "output", value_name = "BAG")]
    pub output: Option<PathBuf>,
    /// Execution device: cpu, cuda or cuda:<id> (overrides `device`).
    #[arg(long = "device", value_name = "DEVICE")]
    pub device: Option<String>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Write the Prometheus metrics snapshot when the run ends.
    #[arg(long = "metrics-out", value_name = "PATH")]
    pub metrics_out: Option<PathBuf>,
}

impl TryFrom<CliArgs> for AnonymizerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self> {
        let mut file = ConfigFile::load(&args.config)?;
        if let Some(input) = args.input {
            file.rosbag.input_bag_path = input;
        }
        if let Some(output) = args.output {
            file.rosbag.output_bag_path = output;
        }
        if let Some(device) = args.device {
            file.device = device;
        }
        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
            metrics_out: args.metrics_out,
        };
        Self::validate(file, telemetry)
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

impl AnonymizerConfig {
    /// Check every field once, load the class list and resolve the device.
    pub fn validate(file: ConfigFile, telemetry: TelemetryOptions) -> Result<Self> {
        let ConfigFile {
            detector,
            segmentation,
            device,
            rosbag,
            blur,
            debug,
        } = file;

        require_file(&detector.model, "detector.model")?;
        if !(0.0..=1.0).contains(&detector.confidence) {
            bail!("detector.confidence must be within [0, 1], got {}", detector.confidence);
        }
        if !(0.0..=1.0).contains(&detector.nms_threshold) {
            bail!(
                "detector.nms_threshold must be within [0, 1], got {}",
                detector.nms_threshold
            );
        }
        if detector.input_size == 0 || detector.input_size % 32 != 0 {
            bail!(
                "detector.input_size must be a positive multiple of 32, got {}",
                detector.input_size
            );
        }
        let classes = ClassList::load(&detector.class_config)?;

        let device = device
            .parse::<Device>()
            .map_err(|err| anyhow!("device: {err}"))?;

        if !rosbag.input_bag_path.exists() {
            bail!(
                "rosbag.input_bag_path {} does not exist",
                rosbag.input_bag_path.display()
            );
        }
        if rosbag.output_bag_path.exists() {
            bail!(
                "rosbag.output_bag_path {} already exists; refusing to overwrite",
                rosbag.output_bag_path.display()
            );
        }
        if rosbag.output_storage_id != SQLITE3_STORAGE_ID {
            bail!(
                "rosbag.output_storage_id {:?} is not supported (only {SQLITE3_STORAGE_ID:?})",
                rosbag.output_storage_id
            );
        }
        if !(1..=100).contains(&rosbag.jpeg_quality) {
            bail!("rosbag.jpeg_quality must be between 1 and 100");
        }

        if blur.kernel_size == 0 || blur.kernel_size % 2 == 0 {
            bail!(
                "blur.kernel_size must be a positive odd number, got {}",
                blur.kernel_size
            );
        }
        if blur.region == RegionPolicy::Mask {
            let seg = segmentation
                .as_ref()
                .ok_or_else(|| anyhow!("blur.region = \"mask\" requires a [segmentation] section"))?;
            require_file(&seg.encoder_model, "segmentation.encoder_model")?;
            require_file(&seg.decoder_model, "segmentation.decoder_model")?;
        }

        Ok(Self {
            detector,
            classes,
            segmentation,
            device,
            rosbag,
            blur,
            debug,
            telemetry,
        })
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            compress_images: self.rosbag.output_save_compressed_image,
            storage_id: self.rosbag.output_storage_id.clone(),
            jpeg_quality: self.rosbag.jpeg_quality,
        }
    }
}

fn require_file(path: &Path, field: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{field} {} is not a file", path.display());
    }
    Ok(())
}

fn default_device() -> String {
    Device::Cpu.to_string()
}

fn default_confidence() -> f32 {
    0.5
}

fn default_nms_threshold() -> f32 {
    0.45
}

fn default_input_size() -> u32 {
    640
}

fn default_storage_id() -> String {
    SQLITE3_STORAGE_ID.to_string()
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_kernel_size() -> u32 {
    31
}

fn default_sigma() -> f64 {
    11.0
}

fn default_preview_path() -> PathBuf {
    PathBuf::from("anonymizer-preview.jpg")
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            confidence: default_confidence(),
            class_config: PathBuf::new(),
            nms_threshold: default_nms_threshold(),
            input_size: default_input_size(),
        }
    }
}

impl Default for RosbagConfig {
    fn default() -> Self {
        Self {
            input_bag_path: PathBuf::new(),
            output_bag_path: PathBuf::new(),
            output_save_compressed_image: false,
            output_storage_id: default_storage_id(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            region: RegionPolicy::Box,
            kernel_size: default_kernel_size(),
            sigma_x: default_sigma(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            print_on_terminal: false,
            show_on_image: false,
            preview_path: default_preview_path(),
        }
    }
}
