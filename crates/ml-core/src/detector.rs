//! YOLO-family object detector backed by ONNX Runtime.

use std::path::Path;

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use ort::{session::Session, value::Tensor};
use tracing::trace;

use crate::{
    detection::{BgrImage, BoundingBox, Detection},
    device::Device,
    error::{InferenceError, model_error},
};

const INPUT_NAME: &str = "images";
const LETTERBOX_FILL: u8 = 114;
const MAX_DETECTIONS: usize = 300;

/// Produces candidate sensitive regions for a frame.
///
/// Implementations must not retain per-frame state: the same image and
/// threshold give the same detections.
pub trait ObjectDetector {
    /// Detections scoring at least `confidence_threshold`, strongest first.
    fn detect(
        &mut self,
        image: BgrImage<'_>,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, InferenceError>;
}

/// Geometry of the resize + pad applied before inference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, bbox: BoundingBox, width: u32, height: u32) -> BoundingBox {
        BoundingBox::new(
            (bbox.x1 - self.pad_x) / self.scale,
            (bbox.y1 - self.pad_y) / self.scale,
            (bbox.x2 - self.pad_x) / self.scale,
            (bbox.y2 - self.pad_y) / self.scale,
        )
        .clamp(width, height)
    }
}

/// ONNX export of an Ultralytics-style detector.
pub struct YoloDetector {
    session: Session,
    device: Device,
    input_size: u32,
    nms_threshold: f32,
}

impl YoloDetector {
    /// Load an ONNX detector expecting a square `input_size` RGB input.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: u32,
    ) -> Result<Self, InferenceError> {
        if input_size == 0 || input_size % 32 != 0 {
            return Err(InferenceError::InvalidInput(format!(
                "detector input size {input_size} must be a positive multiple of 32"
            )));
        }
        let session = device.load_session(model_path.as_ref())?;
        Ok(Self {
            session,
            device,
            input_size,
            nms_threshold: 0.45,
        })
    }

    /// Override the IoU above which same-class boxes are suppressed.
    pub fn with_nms_threshold(mut self, threshold: f32) -> Self {
        self.nms_threshold = threshold;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Resize and pad a BGR frame into a normalised NCHW RGB tensor.
    pub fn letterbox(&self, image: BgrImage<'_>) -> (Array4<f32>, Letterbox) {
        letterbox(image, self.input_size)
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(
        &mut self,
        image: BgrImage<'_>,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        let (input, geometry) = self.letterbox(image);
        let tensor = Tensor::from_array(input).map_err(model_error)?;
        let outputs = self
            .session
            .run(ort::inputs![INPUT_NAME => tensor])
            .map_err(model_error)?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(model_error)?;
        let dims: Vec<i64> = shape.iter().copied().collect();

        let candidates = decode_predictions(&dims, data, confidence_threshold)?;
        trace!(
            candidates = candidates.len(),
            "decoded detector output {dims:?}"
        );
        let kept = non_max_suppression(candidates, self.nms_threshold);
        Ok(kept
            .into_iter()
            .map(|mut det| {
                det.bbox = geometry.unmap(det.bbox, image.width, image.height);
                det
            })
            .collect())
    }
}

pub(crate) fn letterbox(image: BgrImage<'_>, size: u32) -> (Array4<f32>, Letterbox) {
    let scale = (size as f32 / image.width as f32).min(size as f32 / image.height as f32);
    let new_w = ((image.width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((image.height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = resize_rgb(image, new_w, new_h);
    let side = size as usize;
    let mut input = Array4::<f32>::from_elem((1, 3, side, side), LETTERBOX_FILL as f32 / 255.0);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            input[[0, c, ty, tx]] = px.0[c] as f32 / 255.0;
        }
    }

    (
        input,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

pub(crate) fn resize_rgb(image: BgrImage<'_>, width: u32, height: u32) -> RgbImage {
    let rgb = RgbImage::from_fn(image.width, image.height, |x, y| {
        let [b, g, r] = image.pixel(x, y);
        image::Rgb([r, g, b])
    });
    if (width, height) == (image.width, image.height) {
        rgb
    } else {
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    }
}

/// Turn a raw prediction tensor into thresholded detections in letterbox space.
///
/// Two layouts are understood: `[1, 4 + classes, anchors]` (anchor-free heads,
/// class scores only) and `[1, anchors, 5 + classes]` (objectness times class
/// score).
pub(crate) fn decode_predictions(
    dims: &[i64],
    data: &[f32],
    confidence_threshold: f32,
) -> Result<Vec<Detection>, InferenceError> {
    let [batch, a, b] = dims else {
        return Err(InferenceError::UnexpectedOutput(format!(
            "detector output must be rank 3, got {dims:?}"
        )));
    };
    if *batch != 1 {
        return Err(InferenceError::UnexpectedOutput(format!(
            "detector expected batch=1 but received {batch}"
        )));
    }
    let (a, b) = (*a as usize, *b as usize);
    if data.len() < a * b {
        return Err(InferenceError::UnexpectedOutput(format!(
            "detector output holds {} values, shape {dims:?} needs {}",
            data.len(),
            a * b
        )));
    }

    let mut detections = Vec::new();
    if a < b {
        // Channel-major: rows are attributes, columns are anchors.
        let (channels, anchors) = (a, b);
        if channels < 5 {
            return Err(InferenceError::UnexpectedOutput(format!(
                "detector output requires at least 5 channels, got {channels}"
            )));
        }
        for i in 0..anchors {
            let at = |c: usize| data[c * anchors + i];
            let (class_id, confidence) = best_class((4..channels).map(at));
            if confidence < confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(at(0), at(1), at(2), at(3));
            detections.push(Detection::new(bbox, confidence, class_id));
        }
    } else {
        let (anchors, channels) = (a, b);
        if channels < 6 {
            return Err(InferenceError::UnexpectedOutput(format!(
                "detector output requires at least 6 attributes per anchor, got {channels}"
            )));
        }
        for row in data[..anchors * channels].chunks_exact(channels) {
            let objectness = row[4];
            let (class_id, class_score) = best_class(row[5..].iter().copied());
            let confidence = objectness * class_score;
            if confidence < confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
            detections.push(Detection::new(bbox, confidence, class_id));
        }
    }
    Ok(detections)
}

fn best_class(scores: impl Iterator<Item = f32>) -> (usize, f32) {
    scores
        .enumerate()
        .fold((0, f32::MIN), |best, (idx, score)| {
            if score > best.1 { (idx, score) } else { best }
        })
}

/// Greedy per-class suppression, strongest detections first.
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; detections.len()];
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j]
                && detections[i].class_id == detections[j].class_id
                && detections[i].bbox.iou(&detections[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].clone());
        if keep.len() >= MAX_DETECTIONS {
            break;
        }
    }
    keep
}
