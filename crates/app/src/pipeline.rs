//! The per-message loop: passthrough for everything but images, and
//! decode → detect → (refine) → blur → re-encode → write for images.
//!
//! Messages are handled strictly in reader order on the calling thread; the
//! writer only moves the finished bag into place once the loop completes.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use ml_core::{
    BgrImage, Detection, InferenceError, MaskRefiner, ObjectDetector, SamSegmenter, YoloDetector,
};
use rosbag_io::{
    BagMessage, BagReader, BagWriter, COMPRESSED_IMAGE_TYPE, Frame, IMAGE_TYPE, ImageTransport,
    RawImage, decode_image,
};
use tracing::{debug, info, info_span, warn};

use crate::{
    annotation,
    blur::{BlurCoverage, RegionPolicy, blur},
    config::AnonymizerConfig,
    error::PipelineError,
};

/// Counts reported once a run has committed its output bag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub output: PathBuf,
    pub images: u64,
    pub passthrough: u64,
    pub detections: u64,
}

impl RunSummary {
    pub fn messages(&self) -> u64 {
        self.images + self.passthrough
    }
}

/// Outcome of [`Anonymizer::process_frame`].
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    /// Detections that were blurred, masks attached under the `mask` policy.
    pub detections: Vec<Detection>,
    pub coverage: BlurCoverage,
}

/// Detector, optional segmenter and settings for one bag conversion.
pub struct Anonymizer {
    config: AnonymizerConfig,
    detector: Box<dyn ObjectDetector>,
    refiner: Option<Box<dyn MaskRefiner>>,
}

impl Anonymizer {
    /// Wire an anonymizer from already constructed models.
    ///
    /// A refiner is mandatory for the `mask` region policy and ignored for `box`.
    pub fn new(
        config: AnonymizerConfig,
        detector: Box<dyn ObjectDetector>,
        refiner: Option<Box<dyn MaskRefiner>>,
    ) -> Result<Self, PipelineError> {
        if config.blur.region == RegionPolicy::Mask && refiner.is_none() {
            return Err(PipelineError::MissingSegmenter);
        }
        Ok(Self {
            config,
            detector,
            refiner,
        })
    }

    /// Load the ONNX detector, and the segmenter when blurring masks.
    pub fn from_config(config: AnonymizerConfig) -> anyhow::Result<Self> {
        let detector = YoloDetector::new(
            &config.detector.model,
            config.device,
            config.detector.input_size,
        )
        .with_context(|| format!("loading detector {}", config.detector.model.display()))?
        .with_nms_threshold(config.detector.nms_threshold);
        info!(
            device = %detector.device(),
            input_size = detector.input_size(),
            "detector loaded from {}",
            config.detector.model.display()
        );

        let refiner: Option<Box<dyn MaskRefiner>> =
            match (config.blur.region, config.segmentation.as_ref()) {
                (RegionPolicy::Mask, Some(seg)) => Some(Box::new(
                    SamSegmenter::new(&seg.encoder_model, &seg.decoder_model, config.device)
                        .with_context(|| {
                            format!("loading segmenter {}", seg.encoder_model.display())
                        })?,
                )),
                _ => None,
            };
        if refiner.is_some() {
            info!(region = %config.blur.region, "segmenter loaded");
        }
        Ok(Self::new(config, Box::new(detector), refiner)?)
    }

    pub fn config(&self) -> &AnonymizerConfig {
        &self.config
    }

    /// Convert the configured input bag into the configured output bag.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let input = self.config.rosbag.input_bag_path.clone();
        let output = self.config.rosbag.output_bag_path.clone();
        let run_span = info_span!(
            "anonymize.run",
            input = %input.display(),
            output = %output.display(),
            region = %self.config.blur.region,
            kernel_size = self.config.blur.kernel_size,
        );
        let _run_guard = run_span.enter();

        let reader = BagReader::open(&input)?;
        validate_raw_encodings(&reader)?;
        let mut writer = BagWriter::create(
            &output,
            self.config.writer_options(),
            reader.qos_profile_map().clone(),
        )?;
        for topic in reader.topics() {
            writer.register_topic(&topic.name, self.output_type(&topic.type_name))?;
        }
        info!(
            topics = reader.topics().len(),
            staging = %writer.staging_path().display(),
            "anonymizing bag"
        );

        let mut summary = RunSummary::default();
        for message in &reader {
            let message = message?;
            if message.is_image() {
                summary.detections += self.transform(&mut writer, &message)? as u64;
                summary.images += 1;
                metrics::counter!("anonymizer_messages_total", "kind" => "image").increment(1);
            } else {
                writer.write_any(
                    &message.data,
                    &message.type_name,
                    &message.topic,
                    message.timestamp,
                )?;
                summary.passthrough += 1;
                metrics::counter!("anonymizer_messages_total", "kind" => "passthrough")
                    .increment(1);
            }
        }

        let written = writer.finish()?;
        summary.output = written.path;
        info!(
            images = summary.images,
            passthrough = summary.passthrough,
            detections = summary.detections,
            "wrote {}",
            summary.output.display()
        );
        Ok(summary)
    }

    /// Detect, optionally refine, and blur `frame` in place.
    pub fn process_frame(&mut self, frame: &mut Frame) -> Result<ProcessedFrame, PipelineError> {
        let image = BgrImage::new(&frame.data, frame.width, frame.height)?;

        let started = Instant::now();
        let mut detections = self.detector.detect(image, self.config.detector.confidence)?;
        record_latency("detect", started);
        // Detectors may hand back sub-threshold boxes; they are never blurred.
        detections.retain(|d| d.confidence >= self.config.detector.confidence);

        if self.config.blur.region == RegionPolicy::Mask && !detections.is_empty() {
            if let Some(refiner) = self.refiner.as_mut() {
                let started = Instant::now();
                let expected = detections.len();
                detections = refiner.refine(image, detections)?;
                record_latency("segment", started);
                if detections.len() != expected {
                    return Err(PipelineError::ModelInference(InferenceError::UnexpectedOutput(
                        format!(
                            "segmenter returned {} detections for {expected} boxes",
                            detections.len()
                        ),
                    )));
                }
            }
        }

        let started = Instant::now();
        let coverage = blur(
            frame,
            &detections,
            self.config.blur.region,
            self.config.blur.kernel_size,
            self.config.blur.sigma_x,
        )?;
        record_latency("blur", started);
        Ok(ProcessedFrame {
            detections,
            coverage,
        })
    }

    /// Type a source topic is written as.
    fn output_type<'a>(&self, type_name: &'a str) -> &'a str {
        if type_name == IMAGE_TYPE && self.config.rosbag.output_save_compressed_image {
            COMPRESSED_IMAGE_TYPE
        } else {
            type_name
        }
    }

    fn transform(
        &mut self,
        writer: &mut BagWriter,
        message: &BagMessage,
    ) -> Result<usize, PipelineError> {
        let frame_span = info_span!(
            "anonymize.frame",
            topic = %message.topic,
            timestamp = message.timestamp,
            detections = tracing::field::Empty,
        );
        let _frame_guard = frame_span.enter();

        let started = Instant::now();
        let Some((mut frame, source)) = decode_image(message)? else {
            return Err(PipelineError::Io(rosbag_io::BagError::Cdr(format!(
                "{} is not an image type",
                message.type_name
            ))));
        };
        record_latency("decode", started);

        let ProcessedFrame {
            detections,
            coverage,
        } = self.process_frame(&mut frame)?;
        frame_span.record("detections", detections.len());
        for det in &detections {
            metrics::counter!(
                "anonymizer_detections_total",
                "class" => self.config.classes.label(det.class_id)
            )
            .increment(1);
        }

        let started = Instant::now();
        let written_as = match source.raw {
            // Raw sources are patched in their own encoding so untouched
            // pixels keep every recorded byte.
            Some(mut raw) if !self.config.rosbag.output_save_compressed_image => {
                raw.patch(&frame, |x, y| coverage.contains(x, y))?;
                writer.write_raw(&raw, &message.topic, message.timestamp)?;
                ImageTransport::Raw
            }
            _ => writer.write_image(
                &frame,
                source.header,
                &message.topic,
                message.timestamp,
                None,
            )?,
        };
        record_latency("encode", started);
        debug!(?written_as, width = frame.width, height = frame.height, "image written");

        if self.config.debug.print_on_terminal {
            info!(topic = %message.topic, "detections: {}", self.class_counts(&detections));
        }
        if self.config.debug.show_on_image {
            self.write_preview(&frame, &detections);
        }
        Ok(detections.len())
    }

    /// `class=count` for every class in the list, zero counts included.
    fn class_counts(&self, detections: &[Detection]) -> String {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for det in detections {
            *counts.entry(det.class_id).or_default() += 1;
        }
        let classes = &self.config.classes;
        let known = (0..classes.len()).map(|id| (id, counts.remove(&id).unwrap_or(0)))
            .collect::<Vec<_>>();
        let unknown: Vec<(usize, usize)> = counts.into_iter().collect();
        known
            .into_iter()
            .chain(unknown)
            .map(|(id, count)| format!("{}={count}", classes.label(id)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn write_preview(&self, frame: &Frame, detections: &[Detection]) {
        let path: &Path = &self.config.debug.preview_path;
        if let Err(err) =
            annotation::write_preview(frame, detections, &self.config.classes, path)
        {
            warn!("failed to write preview {}: {err}", path.display());
        }
    }
}

/// Fail before any output exists if a raw image topic uses an unknown encoding.
fn validate_raw_encodings(reader: &BagReader) -> Result<(), PipelineError> {
    for topic in reader.topics().iter().filter(|t| t.type_name == IMAGE_TYPE) {
        let Some(first) = reader.first_message(&topic.name)? else {
            continue;
        };
        let encoding = RawImage::from_cdr(&first.data)?.pixel_encoding()?;
        debug!(topic = %topic.name, %encoding, "raw image topic");
    }
    Ok(())
}

fn record_latency(stage: &'static str, started: Instant) {
    metrics::histogram!("anonymizer_stage_latency_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
}
