//! Box-prompted mask refinement with a Segment Anything encoder/decoder pair.

use std::{borrow::Cow, path::Path};

use ndarray::Array4;
use ort::{
    session::{Session, SessionInputValue},
    value::Tensor,
};
use tracing::trace;

use crate::{
    detection::{BgrImage, Detection, Mask},
    detector::resize_rgb,
    device::Device,
    error::{InferenceError, model_error},
};

/// Image input of both SAM and SAM2 encoder exports.
const ENCODER_INPUT: &str = "image";
const ENCODER_SIDE: u32 = 1024;
const LOW_RES_MASK: usize = 256;
const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];
const BOX_TOP_LEFT: f32 = 2.0;
const BOX_BOTTOM_RIGHT: f32 = 3.0;

/// Adds a per-pixel mask to every detection.
///
/// The output has the same length and order as the input; a detection that
/// cannot be masked is an error, never a silent drop.
pub trait MaskRefiner {
    fn refine(
        &mut self,
        image: BgrImage<'_>,
        detections: Vec<Detection>,
    ) -> Result<Vec<Detection>, InferenceError>;
}

struct Embedding {
    name: String,
    shape: Vec<i64>,
    data: Vec<f32>,
}

/// SAM / SAM2 ONNX exports.
///
/// SAM2 decoders are recognised by the encoder emitting `high_res_feats_*`
/// outputs and take `orig_im_size` as `i32` instead of `f32`.
pub struct SamSegmenter {
    encoder: Session,
    decoder: Session,
}

impl SamSegmenter {
    pub fn new<P: AsRef<Path>>(
        encoder_path: P,
        decoder_path: P,
        device: Device,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            encoder: device.load_session(encoder_path.as_ref())?,
            decoder: device.load_session(decoder_path.as_ref())?,
        })
    }

    fn encode(&mut self, image: BgrImage<'_>) -> Result<(Vec<Embedding>, f32), InferenceError> {
        let (input, scale) = encoder_input(image);
        let tensor = Tensor::from_array(input).map_err(model_error)?;
        let outputs = self
            .encoder
            .run(ort::inputs![ENCODER_INPUT => tensor])
            .map_err(model_error)?;

        let mut embeddings = Vec::new();
        for name in outputs.keys().map(|k| k.to_string()).collect::<Vec<_>>() {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(model_error)?;
            embeddings.push(Embedding {
                shape: shape.iter().copied().collect(),
                data: data.to_vec(),
                name,
            });
        }
        if !embeddings.iter().any(|e| e.name == "image_embeddings") {
            return Err(InferenceError::UnexpectedOutput(
                "segment encoder produced no image_embeddings output".into(),
            ));
        }
        Ok((embeddings, scale))
    }

    fn decode(
        &mut self,
        embeddings: &[Embedding],
        detection: &Detection,
        scale: f32,
        image: BgrImage<'_>,
    ) -> Result<Mask, String> {
        let sam2 = embeddings.iter().any(|e| e.name.starts_with("high_res_feats"));
        let b = detection.bbox;
        let coords = vec![b.x1 * scale, b.y1 * scale, b.x2 * scale, b.y2 * scale];

        let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::new();
        for embedding in embeddings {
            let tensor = Tensor::from_array((embedding.shape.clone(), embedding.data.clone()))
                .map_err(|e| e.to_string())?;
            inputs.push((Cow::Owned(embedding.name.clone()), tensor.into()));
        }
        let f32_input = |shape: Vec<i64>, data: Vec<f32>| {
            Tensor::from_array((shape, data))
                .map(SessionInputValue::from)
                .map_err(|e| e.to_string())
        };
        inputs.push(("point_coords".into(), f32_input(vec![1, 2, 2], coords)?));
        inputs.push((
            "point_labels".into(),
            f32_input(vec![1, 2], vec![BOX_TOP_LEFT, BOX_BOTTOM_RIGHT])?,
        ));
        inputs.push((
            "mask_input".into(),
            f32_input(
                vec![1, 1, LOW_RES_MASK as i64, LOW_RES_MASK as i64],
                vec![0.0; LOW_RES_MASK * LOW_RES_MASK],
            )?,
        ));
        inputs.push(("has_mask_input".into(), f32_input(vec![1], vec![0.0])?));
        let orig_size = if sam2 {
            Tensor::from_array((vec![2i64], vec![image.height as i32, image.width as i32]))
                .map(SessionInputValue::from)
                .map_err(|e| e.to_string())?
        } else {
            f32_input(vec![2], vec![image.height as f32, image.width as f32])?
        };
        inputs.push(("orig_im_size".into(), orig_size));

        let outputs = self.decoder.run(inputs).map_err(|e| e.to_string())?;
        let (shape, logits) = outputs["masks"]
            .try_extract_tensor::<f32>()
            .map_err(|e| e.to_string())?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        let best = match outputs.get("iou_predictions") {
            Some(scores) => {
                let (_, scores) = scores.try_extract_tensor::<f32>().map_err(|e| e.to_string())?;
                argmax(scores)
            }
            None => 0,
        };
        mask_from_logits(&dims, logits, best, image.width, image.height, scale)
    }
}

impl MaskRefiner for SamSegmenter {
    fn refine(
        &mut self,
        image: BgrImage<'_>,
        detections: Vec<Detection>,
    ) -> Result<Vec<Detection>, InferenceError> {
        if detections.is_empty() {
            return Ok(detections);
        }
        let (embeddings, scale) = self.encode(image)?;

        let mut refined = Vec::with_capacity(detections.len());
        for (index, detection) in detections.into_iter().enumerate() {
            let mask = self
                .decode(&embeddings, &detection, scale, image)
                .map_err(|reason| InferenceError::Segmentation { index, reason })?;
            trace!(index, pixels = mask.count(), "refined detection");
            refined.push(detection.with_mask(mask));
        }
        Ok(refined)
    }
}

/// Longest side to 1024, ImageNet normalisation, zero padded bottom/right.
fn encoder_input(image: BgrImage<'_>) -> (Array4<f32>, f32) {
    let scale = ENCODER_SIDE as f32 / image.width.max(image.height) as f32;
    let new_w = ((image.width as f32 * scale).round() as u32).clamp(1, ENCODER_SIDE);
    let new_h = ((image.height as f32 * scale).round() as u32).clamp(1, ENCODER_SIDE);
    let resized = resize_rgb(image, new_w, new_h);

    let side = ENCODER_SIDE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - PIXEL_MEAN[c]) / PIXEL_STD[c];
        }
    }
    (input, scale)
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Threshold mask logits at zero into a frame-sized mask.
///
/// Masks already at frame resolution are used as-is; anything else is read
/// as covering the padded 1024 square the encoder saw.
fn mask_from_logits(
    dims: &[i64],
    logits: &[f32],
    candidate: usize,
    width: u32,
    height: u32,
    scale: f32,
) -> Result<Mask, String> {
    let [_, candidates, mh, mw] = dims else {
        return Err(format!("mask output must be rank 4, got {dims:?}"));
    };
    let (candidates, mh, mw) = (*candidates as usize, *mh as usize, *mw as usize);
    if candidates == 0 || mh == 0 || mw == 0 {
        return Err(format!("mask output is empty: {dims:?}"));
    }
    let candidate = candidate.min(candidates - 1);
    let plane = mh * mw;
    let Some(logits) = logits.get(candidate * plane..(candidate + 1) * plane) else {
        return Err(format!(
            "mask output holds {} values, shape {dims:?} needs more",
            logits.len()
        ));
    };

    if (mw, mh) == (width as usize, height as usize) {
        return Ok(Mask::from_fn(width, height, |x, y| {
            logits[y as usize * mw + x as usize] > 0.0
        }));
    }
    let to_mask_x = scale * mw as f32 / ENCODER_SIDE as f32;
    let to_mask_y = scale * mh as f32 / ENCODER_SIDE as f32;
    Ok(Mask::from_fn(width, height, |x, y| {
        let mx = (((x as f32 + 0.5) * to_mask_x) as usize).min(mw - 1);
        let my = (((y as f32 + 0.5) * to_mask_y) as usize).min(mh - 1);
        logits[my * mw + mx] > 0.0
    }))
}
