use crate::error::InferenceError;

/// Borrowed BGR8 image handed to the models.
#[derive(Clone, Copy, Debug)]
pub struct BgrImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> BgrImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self, InferenceError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(InferenceError::InvalidInput(format!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                data.len()
            )));
        }
        if width == 0 || height == 0 {
            return Err(InferenceError::InvalidInput(format!(
                "empty frame {width}x{height}"
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Axis-aligned box in frame pixel coordinates, corners `(x1, y1)`–`(x2, y2)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer pixel rectangle, half-open: `[x, x + width) × [y, y + height)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(
            cx - width / 2.0,
            cy - height / 2.0,
            cx + width / 2.0,
            cy + height / 2.0,
        )
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 { intersection / union } else { 0.0 }
    }

    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Pixels covered by the box inside a `width × height` frame.
    ///
    /// Corners are truncated toward zero and clipped; `None` when nothing is left.
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        let clip = |v: f32, max: u32| -> u32 {
            if v.is_nan() { 0 } else { (v.max(0.0) as u32).min(max) }
        };
        let x1 = clip(self.x1, width);
        let y1 = clip(self.y1, height);
        let x2 = clip(self.x2, width);
        let y2 = clip(self.y2, height);
        (x2 > x1 && y2 > y1).then_some(PixelRect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// Per-pixel membership mask with the dimensions of its frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Mask covering the pixels of `bbox`.
    pub fn from_box(width: u32, height: u32, bbox: &BoundingBox) -> Self {
        match bbox.pixel_rect(width, height) {
            Some(rect) => Self::from_fn(width, height, |x, y| {
                x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height
            }),
            None => Self::empty(width, height),
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    /// Tightest rectangle holding every set pixel.
    pub fn bounds(&self) -> Option<PixelRect> {
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut any = false;
        for y in 0..self.height {
            let row = &self.data[y as usize * self.width as usize..][..self.width as usize];
            for (x, set) in row.iter().enumerate() {
                if *set {
                    let x = x as u32;
                    any = true;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }
        any.then(|| PixelRect {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }
}

/// Sensitive region proposed by a detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// Index into the class list.
    pub class_id: usize,
    /// Attached by a [`crate::MaskRefiner`].
    pub mask: Option<Mask>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: usize) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }
}
