#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anonymizer::{AnonymizerConfig, ClassList, RegionPolicy};
use ml_core::{BgrImage, BoundingBox, Detection, InferenceError, Mask, MaskRefiner, ObjectDetector};
use rosbag_io::{
    BagMessage, BagReader, BagWriter, CompressedImage, CompressionFormat, Frame, Header,
    PixelEncoding, QosProfileMap, RawImage, WriterOptions,
};
use tempfile::TempDir;

pub const IMU_TYPE: &str = "sensor_msgs/msg/Imu";
pub const QOS: &str = "- history: 3\n  depth: 0\n  reliability: 1\n  durability: 2\n";

/// Source bag in a temp dir plus a not-yet-existing output path next to it.
pub struct BagFixture {
    pub dir: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl BagFixture {
    pub fn new(messages: &[(&str, &str, i64, Vec<u8>)]) -> Self {
        Self::with_silent_topics(messages, &[])
    }

    /// Like [`BagFixture::new`], plus `(topic, type)` pairs declared without messages.
    pub fn with_silent_topics(
        messages: &[(&str, &str, i64, Vec<u8>)],
        silent: &[(&str, &str)],
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        let qos: QosProfileMap = messages
            .iter()
            .map(|(topic, ..)| *topic)
            .chain(silent.iter().map(|(topic, _)| *topic))
            .map(|topic| (topic.to_string(), QOS.to_string()))
            .collect();
        let mut writer = BagWriter::create(&input, WriterOptions::default(), qos).unwrap();
        for (topic, type_name) in silent {
            writer.register_topic(topic, type_name).unwrap();
        }
        for (topic, type_name, timestamp, data) in messages {
            writer.write_any(data, type_name, topic, *timestamp).unwrap();
        }
        writer.finish().unwrap();
        Self { dir, input, output }
    }

    pub fn config(&self, region: RegionPolicy) -> AnonymizerConfig {
        let mut config = AnonymizerConfig {
            classes: ClassList::new(vec!["face".into(), "license_plate".into()]),
            ..AnonymizerConfig::default()
        };
        config.rosbag.input_bag_path = self.input.clone();
        config.rosbag.output_bag_path = self.output.clone();
        config.blur.region = region;
        config.debug.preview_path = self.dir.path().join("preview.jpg");
        config
    }
}

pub fn read_all(path: &Path) -> Vec<BagMessage> {
    BagReader::open(path)
        .unwrap()
        .messages()
        .collect::<Result<_, _>>()
        .unwrap()
}

pub fn header(sec: i32) -> Header {
    Header {
        stamp_sec: sec,
        stamp_nanosec: 500,
        frame_id: "camera".into(),
    }
}

/// Gray frame: flat 128 everywhere except a noisy square `[from, to)`.
pub fn noisy_square(width: u32, height: u32, from: u32, to: u32) -> Frame {
    let mut frame = Frame::filled(width, height, [128, 128, 128]);
    let mut state = 0x2545_f491_u32;
    for y in from..to {
        for x in from..to {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state % 256) as u8;
            frame.set_pixel(x, y, [v, v, v]);
        }
    }
    frame
}

pub fn raw_image(frame: &Frame, encoding: PixelEncoding, sec: i32) -> Vec<u8> {
    RawImage::from_frame(frame, header(sec), encoding).to_cdr()
}

/// Raw image with deterministic, non-repeating bytes in every position,
/// alpha and low bytes of 16-bit samples included.
pub fn patterned_raw(width: u32, height: u32, encoding: PixelEncoding, sec: i32) -> RawImage {
    let step = width * encoding.bytes_per_pixel() as u32;
    let data = (0..step * height)
        .map(|i| (i.wrapping_mul(37) ^ (i >> 3)) as u8)
        .collect();
    RawImage {
        header: header(sec),
        height,
        width,
        encoding: encoding.name().to_string(),
        is_bigendian: false,
        step,
        data,
    }
}

pub fn png_image(frame: &Frame, sec: i32) -> Vec<u8> {
    CompressedImage::from_frame(frame, header(sec), CompressionFormat::Png, 100)
        .unwrap()
        .to_cdr()
}

/// Variance of the first channel over `[from, to)²`.
pub fn variance(frame: &Frame, from: u32, to: u32) -> f64 {
    let values: Vec<f64> = (from..to)
        .flat_map(|y| (from..to).map(move |x| (x, y)))
        .map(|(x, y)| frame.pixel(x, y)[0] as f64)
        .collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn square(from: f32, to: f32, confidence: f32, class_id: usize) -> Detection {
    Detection::new(BoundingBox::new(from, from, to, to), confidence, class_id)
}

/// Returns the same detections for every frame, honouring the threshold.
pub struct FixedDetector {
    pub detections: Vec<Detection>,
}

impl ObjectDetector for FixedDetector {
    fn detect(
        &mut self,
        _image: BgrImage<'_>,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        Ok(self
            .detections
            .iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .cloned()
            .collect())
    }
}

/// Masks only the top-left quadrant of each box.
pub struct QuadrantRefiner;

impl MaskRefiner for QuadrantRefiner {
    fn refine(
        &mut self,
        image: BgrImage<'_>,
        detections: Vec<Detection>,
    ) -> Result<Vec<Detection>, InferenceError> {
        Ok(detections
            .into_iter()
            .map(|det| {
                let b = det.bbox;
                let quadrant = BoundingBox::new(
                    b.x1,
                    b.y1,
                    (b.x1 + b.x2) / 2.0,
                    (b.y1 + b.y2) / 2.0,
                );
                let mask = Mask::from_box(image.width, image.height, &quadrant);
                det.with_mask(mask)
            })
            .collect())
    }
}

/// Cannot produce a mask for any box.
pub struct FailingRefiner;

impl MaskRefiner for FailingRefiner {
    fn refine(
        &mut self,
        _image: BgrImage<'_>,
        _detections: Vec<Detection>,
    ) -> Result<Vec<Detection>, InferenceError> {
        Err(InferenceError::Segmentation {
            index: 0,
            reason: "decoder produced no mask".into(),
        })
    }
}
