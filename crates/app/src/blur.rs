//! Gaussian blur of detected regions, in place on a canonical BGR frame.

use std::{fmt, str::FromStr};

use ml_core::{Detection, PixelRect};
use rosbag_io::Frame;
use serde::Deserialize;

use crate::error::PipelineError;

/// Which pixels of a detection get blurred.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegionPolicy {
    /// The whole bounding-box crop.
    #[default]
    Box,
    /// Only pixels inside the detection's segmentation mask.
    Mask,
}

impl FromStr for RegionPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "box" => Ok(Self::Box),
            "mask" => Ok(Self::Mask),
            other => Err(PipelineError::Blur(format!(
                "unknown blur region {other:?} (expected box or mask)"
            ))),
        }
    }
}

impl fmt::Display for RegionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Box => "box",
            Self::Mask => "mask",
        })
    }
}

/// Pixels a [`blur`] call wrote to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlurCoverage {
    width: u32,
    touched: Vec<bool>,
}

impl BlurCoverage {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            touched: vec![false; width as usize * height as usize],
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.touched
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.touched.iter().filter(|&&t| t).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.touched.contains(&true)
    }

    fn mark(&mut self, x: u32, y: u32) {
        let idx = y as usize * self.width as usize + x as usize;
        if let Some(flag) = self.touched.get_mut(idx) {
            *flag = true;
        }
    }
}

/// Blur every detection's region of `frame`, one after another.
///
/// Later detections see the output of earlier ones, so overlapping regions
/// are blurred cumulatively. `sigma <= 0` derives sigma from `kernel_size`.
/// Returns the pixels that were overwritten.
pub fn blur(
    frame: &mut Frame,
    detections: &[Detection],
    policy: RegionPolicy,
    kernel_size: u32,
    sigma: f64,
) -> Result<BlurCoverage, PipelineError> {
    let taps = gaussian_taps(kernel_size, sigma)?;
    let radius = taps.len() / 2;
    let mut coverage = BlurCoverage::new(frame.width, frame.height);

    for (index, detection) in detections.iter().enumerate() {
        match policy {
            RegionPolicy::Box => {
                if let Some(rect) = detection.bbox.pixel_rect(frame.width, frame.height) {
                    let blurred = blur_rect(frame, rect, &taps);
                    paste(frame, &mut coverage, rect, &blurred, |_, _| true);
                }
            }
            RegionPolicy::Mask => {
                let mask = detection.mask.as_ref().ok_or_else(|| {
                    PipelineError::Blur(format!("detection #{index} has no mask"))
                })?;
                if (mask.width, mask.height) != (frame.width, frame.height) {
                    return Err(PipelineError::Blur(format!(
                        "mask of detection #{index} is {}x{}, frame is {}x{}",
                        mask.width, mask.height, frame.width, frame.height
                    )));
                }
                if mask.data.len() != mask.width as usize * mask.height as usize {
                    return Err(PipelineError::Blur(format!(
                        "mask of detection #{index} holds {} values for {}x{} pixels",
                        mask.data.len(),
                        mask.width,
                        mask.height
                    )));
                }
                let Some(bounds) = mask.bounds() else {
                    continue;
                };
                // Pad by the kernel radius so pixels near the mask edge are
                // filtered from real neighbours, as a full-frame blur would be.
                let rect = expand(bounds, radius as u32, frame.width, frame.height);
                let blurred = blur_rect(frame, rect, &taps);
                paste(frame, &mut coverage, rect, &blurred, |x, y| mask.get(x, y));
            }
        }
    }
    Ok(coverage)
}

/// Normalised 1-D Gaussian taps for an odd `kernel_size`.
pub(crate) fn gaussian_taps(kernel_size: u32, sigma: f64) -> Result<Vec<f32>, PipelineError> {
    if kernel_size == 0 || kernel_size % 2 == 0 {
        return Err(PipelineError::Blur(format!(
            "kernel size must be a positive odd number, got {kernel_size}"
        )));
    }
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let center = (kernel_size as f64 - 1.0) / 2.0;
    let weights: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    Ok(weights.into_iter().map(|w| (w / sum) as f32).collect())
}

/// Separable blur of the pixels inside `rect`, borders reflected inside the rect.
fn blur_rect(frame: &Frame, rect: PixelRect, taps: &[f32]) -> Vec<u8> {
    let (w, h) = (rect.width as usize, rect.height as usize);
    let radius = (taps.len() / 2) as isize;
    let src = |x: usize, y: usize, c: usize| {
        let idx = ((rect.y as usize + y) * frame.width as usize + rect.x as usize + x) * 3 + c;
        frame.data[idx] as f32
    };

    let mut horizontal = vec![0.0f32; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let mut acc = 0.0f32;
                for (k, &tap) in taps.iter().enumerate() {
                    let sx = reflect101(x as isize + k as isize - radius, w);
                    acc += tap * src(sx, y, c);
                }
                horizontal[(y * w + x) * 3 + c] = acc;
            }
        }
    }

    let mut out = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let mut acc = 0.0f32;
                for (k, &tap) in taps.iter().enumerate() {
                    let sy = reflect101(y as isize + k as isize - radius, h);
                    acc += tap * horizontal[(sy * w + x) * 3 + c];
                }
                out[(y * w + x) * 3 + c] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

fn paste(
    frame: &mut Frame,
    coverage: &mut BlurCoverage,
    rect: PixelRect,
    pixels: &[u8],
    keep: impl Fn(u32, u32) -> bool,
) {
    for y in 0..rect.height {
        for x in 0..rect.width {
            let (fx, fy) = (rect.x + x, rect.y + y);
            if keep(fx, fy) {
                let i = ((y * rect.width + x) * 3) as usize;
                frame.set_pixel(fx, fy, [pixels[i], pixels[i + 1], pixels[i + 2]]);
                coverage.mark(fx, fy);
            }
        }
    }
}

fn expand(rect: PixelRect, by: u32, width: u32, height: u32) -> PixelRect {
    let x = rect.x.saturating_sub(by);
    let y = rect.y.saturating_sub(by);
    let right = (rect.x + rect.width + by).min(width);
    let bottom = (rect.y + rect.height + by).min(height);
    PixelRect {
        x,
        y,
        width: right - x,
        height: bottom - y,
    }
}

/// `gfedcb|abcdefgh|gfedcba` border handling.
fn reflect101(idx: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut idx = idx;
    while idx < 0 || idx > last {
        if idx < 0 {
            idx = -idx;
        }
        if idx > last {
            idx = 2 * last - idx;
        }
    }
    idx as usize
}
