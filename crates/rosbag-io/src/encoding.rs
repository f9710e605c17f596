//! Pixel encoding table for raw `sensor_msgs/msg/Image` payloads.
//!
//! Every supported encoding has a forward conversion into the canonical BGR8
//! [`Frame`] and a backward conversion from it. The table is closed: encodings
//! outside it are rejected with [`BagError::UnsupportedEncoding`].

use std::{fmt, str::FromStr};

use crate::types::{BagError, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    Bgr8,
    Rgb8,
    Bgra8,
    Rgba8,
    Mono8,
    Mono16,
    Bgr16,
    Rgb16,
}

const ENCODING_NAMES: [(&str, PixelEncoding); 8] = [
    ("bgr8", PixelEncoding::Bgr8),
    ("rgb8", PixelEncoding::Rgb8),
    ("bgra8", PixelEncoding::Bgra8),
    ("rgba8", PixelEncoding::Rgba8),
    ("mono8", PixelEncoding::Mono8),
    ("mono16", PixelEncoding::Mono16),
    ("bgr16", PixelEncoding::Bgr16),
    ("rgb16", PixelEncoding::Rgb16),
];

impl PixelEncoding {
    /// The canonical in-memory representation used by the pipeline.
    pub const CANONICAL: PixelEncoding = PixelEncoding::Bgr8;

    pub fn name(self) -> &'static str {
        ENCODING_NAMES
            .iter()
            .find(|(_, encoding)| *encoding == self)
            .map(|(name, _)| *name)
            .unwrap_or("bgr8")
    }

    pub fn channels(self) -> usize {
        match self {
            Self::Mono8 | Self::Mono16 => 1,
            Self::Bgr8 | Self::Rgb8 | Self::Bgr16 | Self::Rgb16 => 3,
            Self::Bgra8 | Self::Rgba8 => 4,
        }
    }

    pub fn bytes_per_channel(self) -> usize {
        match self {
            Self::Mono16 | Self::Bgr16 | Self::Rgb16 => 2,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.channels() * self.bytes_per_channel()
    }

    pub fn is_canonical(self) -> bool {
        self == Self::CANONICAL
    }

    /// Convert a raw image buffer into a canonical BGR8 frame.
    ///
    /// `step` is the row stride in bytes; rows may be padded. 16-bit samples
    /// are reduced to their high byte; [`RawImage::patch`] writes results back
    /// without that loss.
    ///
    /// [`RawImage::patch`]: crate::messages::RawImage::patch
    pub fn forward(
        self,
        data: &[u8],
        width: u32,
        height: u32,
        step: u32,
        big_endian: bool,
    ) -> Result<Frame, BagError> {
        let row_bytes = width as usize * self.bytes_per_pixel();
        let step = step as usize;
        if step < row_bytes {
            return Err(BagError::Cdr(format!(
                "{} row step {step} shorter than {row_bytes} bytes",
                self.name()
            )));
        }
        let needed = step * height.saturating_sub(1) as usize + row_bytes;
        if height > 0 && data.len() < needed {
            return Err(BagError::FrameSize {
                width,
                height,
                actual: data.len(),
                expected: needed,
            });
        }

        let bpc = self.bytes_per_channel();
        let mut out = Vec::with_capacity(Frame::expected_len(width, height));
        for row in 0..height as usize {
            let row_data = &data[row * step..row * step + row_bytes];
            for px in row_data.chunks_exact(self.bytes_per_pixel()) {
                let sample = |channel: usize| -> u8 {
                    let offset = channel * bpc;
                    if bpc == 1 {
                        px[offset]
                    } else if big_endian {
                        px[offset]
                    } else {
                        px[offset + 1]
                    }
                };
                let bgr = match self {
                    Self::Bgr8 | Self::Bgr16 | Self::Bgra8 => [sample(0), sample(1), sample(2)],
                    Self::Rgb8 | Self::Rgb16 | Self::Rgba8 => [sample(2), sample(1), sample(0)],
                    Self::Mono8 | Self::Mono16 => {
                        let v = sample(0);
                        [v, v, v]
                    }
                };
                out.extend_from_slice(&bgr);
            }
        }
        Frame::new(width, height, out)
    }

    /// Convert a canonical frame back into this encoding.
    ///
    /// Returns the tightly packed little-endian buffer and its row step.
    /// Alpha channels come out opaque.
    pub fn backward(self, frame: &Frame) -> (Vec<u8>, u32) {
        let bpp = self.bytes_per_pixel();
        let step = frame.width as usize * bpp;
        let mut out = vec![0u8; step * frame.height as usize];
        for (px, bgr) in out.chunks_exact_mut(bpp).zip(frame.data.chunks_exact(3)) {
            if self.channels() == 4 {
                px[3] = u8::MAX;
            }
            self.store(px, [bgr[0], bgr[1], bgr[2]], false);
        }
        (out, step as u32)
    }

    /// Overwrite the colour of one encoded pixel with a BGR8 value.
    ///
    /// `px` holds exactly one pixel. Alpha is left as it was and 16-bit
    /// samples are widened so that 255 becomes 65535.
    pub fn store(self, px: &mut [u8], bgr: [u8; 3], big_endian: bool) {
        let [b, g, r] = bgr;
        let put16 = |px: &mut [u8], channel: usize, v: u8| {
            let bytes = if big_endian {
                widen(v).to_be_bytes()
            } else {
                widen(v).to_le_bytes()
            };
            px[channel * 2..channel * 2 + 2].copy_from_slice(&bytes);
        };
        match self {
            Self::Bgr8 | Self::Bgra8 => px[..3].copy_from_slice(&[b, g, r]),
            Self::Rgb8 | Self::Rgba8 => px[..3].copy_from_slice(&[r, g, b]),
            Self::Mono8 => px[0] = luma(b, g, r),
            Self::Mono16 => put16(&mut *px, 0, luma(b, g, r)),
            Self::Bgr16 => {
                for (channel, v) in [b, g, r].into_iter().enumerate() {
                    put16(&mut *px, channel, v);
                }
            }
            Self::Rgb16 => {
                for (channel, v) in [r, g, b].into_iter().enumerate() {
                    put16(&mut *px, channel, v);
                }
            }
        }
    }
}

impl FromStr for PixelEncoding {
    type Err = BagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ENCODING_NAMES
            .iter()
            .find(|(name, _)| *name == lowered)
            .map(|(_, encoding)| *encoding)
            .ok_or_else(|| BagError::UnsupportedEncoding(s.to_string()))
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ITU-R BT.601 luma in fixed point, matching the usual BGR→gray conversion.
fn luma(b: u8, g: u8, r: u8) -> u8 {
    let y = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14;
    y.min(255) as u8
}

fn widen(v: u8) -> u16 {
    v as u16 * 257
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back_to_the_same_encoding() {
        for (name, encoding) in ENCODING_NAMES {
            assert_eq!(name.parse::<PixelEncoding>().unwrap(), encoding);
            assert_eq!(encoding.name(), name);
        }
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let err = "yuv422".parse::<PixelEncoding>().unwrap_err();
        assert!(matches!(err, BagError::UnsupportedEncoding(name) if name == "yuv422"));
    }

    #[test]
    fn rgb8_forward_swaps_channels() {
        let frame = PixelEncoding::Rgb8
            .forward(&[10, 20, 30, 40, 50, 60], 2, 1, 6, false)
            .unwrap();
        assert_eq!(frame.data, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn padded_rows_are_skipped() {
        // 1x2 mono8 image with a 4 byte step.
        let data = [7, 0, 0, 0, 9, 0, 0, 0];
        let frame = PixelEncoding::Mono8.forward(&data, 1, 2, 4, false).unwrap();
        assert_eq!(frame.data, vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn mono16_respects_endianness() {
        let le = PixelEncoding::Mono16
            .forward(&[0x34, 0x12], 1, 1, 2, false)
            .unwrap();
        let be = PixelEncoding::Mono16
            .forward(&[0x12, 0x34], 1, 1, 2, true)
            .unwrap();
        assert_eq!(le.data, vec![0x12; 3]);
        assert_eq!(be.data, vec![0x12; 3]);
    }

    #[test]
    fn short_buffer_fails() {
        let err = PixelEncoding::Bgr8
            .forward(&[1, 2, 3], 2, 1, 6, false)
            .unwrap_err();
        assert!(matches!(err, BagError::FrameSize { .. }));
    }

    #[test]
    fn bgra_backward_writes_opaque_alpha() {
        let frame = Frame::new(1, 1, vec![1, 2, 3]).unwrap();
        assert_eq!(PixelEncoding::Bgra8.backward(&frame), (vec![1, 2, 3, 255], 4));
        assert_eq!(PixelEncoding::Rgba8.backward(&frame), (vec![3, 2, 1, 255], 4));
    }

    #[test]
    fn rgb16_backward_widens_each_sample() {
        let frame = Frame::new(1, 1, vec![0, 1, 255]).unwrap();
        let (raw, step) = PixelEncoding::Rgb16.backward(&frame);
        assert_eq!(step, 6);
        assert_eq!(raw, vec![0xff, 0xff, 0x01, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn store_keeps_alpha_and_endianness() {
        let mut bgra = [1, 2, 3, 77];
        PixelEncoding::Bgra8.store(&mut bgra, [9, 8, 7], false);
        assert_eq!(bgra, [9, 8, 7, 77]);

        let mut be = [0u8; 2];
        PixelEncoding::Mono16.store(&mut be, [255, 255, 255], true);
        assert_eq!(be, [0xff, 0xff]);

        let mut le = [0u8; 6];
        PixelEncoding::Bgr16.store(&mut le, [1, 0, 0], false);
        assert_eq!(le, [0x01, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn mono_backward_uses_luma() {
        let frame = Frame::filled(1, 1, [255, 255, 255]);
        let (raw, step) = PixelEncoding::Mono8.backward(&frame);
        assert_eq!((raw, step), (vec![255], 1));
    }
}
