//! `sensor_msgs` image messages and their conversion to and from [`Frame`].

use image::{
    ExtendedColorType, ImageEncoder, RgbImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};

use crate::{
    cdr::{CdrReader, CdrWriter},
    encoding::PixelEncoding,
    types::{BagError, BagMessage, Frame, ImageTransport},
};

/// `std_msgs/msg/Header`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub stamp_sec: i32,
    pub stamp_nanosec: u32,
    pub frame_id: String,
}

impl Header {
    fn read(reader: &mut CdrReader<'_>) -> Result<Self, BagError> {
        Ok(Self {
            stamp_sec: reader.read_i32()?,
            stamp_nanosec: reader.read_u32()?,
            frame_id: reader.read_string()?,
        })
    }

    fn write(&self, writer: &mut CdrWriter) {
        writer.write_i32(self.stamp_sec);
        writer.write_u32(self.stamp_nanosec);
        writer.write_string(&self.frame_id);
    }
}

/// `sensor_msgs/msg/Image`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    pub is_bigendian: bool,
    pub step: u32,
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn from_cdr(bytes: &[u8]) -> Result<Self, BagError> {
        let mut reader = CdrReader::new(bytes)?;
        let header = Header::read(&mut reader)?;
        let height = reader.read_u32()?;
        let width = reader.read_u32()?;
        let encoding = reader.read_string()?;
        let is_bigendian = reader.read_u8()? != 0;
        let step = reader.read_u32()?;
        let data = reader.read_byte_sequence()?.to_vec();
        Ok(Self {
            header,
            height,
            width,
            encoding,
            is_bigendian,
            step,
            data,
        })
    }

    pub fn to_cdr(&self) -> Vec<u8> {
        let mut writer = CdrWriter::with_capacity(self.data.len() + 64);
        self.header.write(&mut writer);
        writer.write_u32(self.height);
        writer.write_u32(self.width);
        writer.write_string(&self.encoding);
        writer.write_u8(self.is_bigendian as u8);
        writer.write_u32(self.step);
        writer.write_byte_sequence(&self.data);
        writer.finish()
    }

    pub fn pixel_encoding(&self) -> Result<PixelEncoding, BagError> {
        self.encoding.parse()
    }

    pub fn to_frame(&self) -> Result<Frame, BagError> {
        let encoding = self.pixel_encoding()?;
        if encoding.is_canonical() && self.step == self.width * 3 {
            return Frame::new(self.width, self.height, self.data.clone());
        }
        encoding.forward(
            &self.data,
            self.width,
            self.height,
            self.step,
            self.is_bigendian,
        )
    }

    /// Write the pixels of `frame` for which `touched(x, y)` holds back into
    /// `data`, in this image's own encoding, step and byte order.
    ///
    /// Every other byte stays as recorded, so untouched pixels keep their full
    /// 16-bit depth and alpha.
    pub fn patch(
        &mut self,
        frame: &Frame,
        touched: impl Fn(u32, u32) -> bool,
    ) -> Result<(), BagError> {
        let encoding = self.pixel_encoding()?;
        if (frame.width, frame.height) != (self.width, self.height) {
            return Err(BagError::FrameSize {
                width: self.width,
                height: self.height,
                actual: frame.data.len(),
                expected: Frame::expected_len(self.width, self.height),
            });
        }
        let bpp = encoding.bytes_per_pixel();
        let step = self.step as usize;
        let data_len = self.data.len();
        for y in 0..self.height {
            for x in 0..self.width {
                if !touched(x, y) {
                    continue;
                }
                let offset = y as usize * step + x as usize * bpp;
                let px = self.data.get_mut(offset..offset + bpp).ok_or_else(|| {
                    BagError::Cdr(format!(
                        "pixel ({x}, {y}) lies past the {data_len} byte image buffer"
                    ))
                })?;
                encoding.store(px, frame.pixel(x, y), self.is_bigendian);
            }
        }
        Ok(())
    }

    pub fn from_frame(frame: &Frame, header: Header, encoding: PixelEncoding) -> Self {
        let (data, step) = encoding.backward(frame);
        Self {
            header,
            height: frame.height,
            width: frame.width,
            encoding: encoding.name().to_string(),
            is_bigendian: false,
            step,
            data,
        }
    }
}

/// Codec named by the `format` field of a compressed image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionFormat {
    Jpeg,
    Png,
}

impl CompressionFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// `sensor_msgs/msg/CompressedImage`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedImage {
    pub header: Header,
    pub format: String,
    pub data: Vec<u8>,
}

impl CompressedImage {
    pub fn from_cdr(bytes: &[u8]) -> Result<Self, BagError> {
        let mut reader = CdrReader::new(bytes)?;
        Ok(Self {
            header: Header::read(&mut reader)?,
            format: reader.read_string()?,
            data: reader.read_byte_sequence()?.to_vec(),
        })
    }

    pub fn to_cdr(&self) -> Vec<u8> {
        let mut writer = CdrWriter::with_capacity(self.data.len() + 64);
        self.header.write(&mut writer);
        writer.write_string(&self.format);
        writer.write_byte_sequence(&self.data);
        writer.finish()
    }

    /// Decode straight to the canonical BGR8 frame; the codec is sniffed from
    /// the payload rather than trusted from `format`.
    pub fn to_frame(&self) -> Result<Frame, BagError> {
        let rgb = image::load_from_memory(&self.data)?.to_rgb8();
        Ok(rgb_image_to_frame(&rgb))
    }

    pub fn from_frame(
        frame: &Frame,
        header: Header,
        format: CompressionFormat,
        jpeg_quality: u8,
    ) -> Result<Self, BagError> {
        let rgb = frame_to_rgb_image(frame);
        let mut buffer = Vec::new();
        match format {
            CompressionFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
                    .encode_image(&rgb)?;
            }
            CompressionFormat::Png => {
                PngEncoder::new(&mut buffer).write_image(
                    rgb.as_raw(),
                    frame.width,
                    frame.height,
                    ExtendedColorType::Rgb8,
                )?;
            }
        }
        Ok(Self {
            header,
            format: format.name().to_string(),
            data: buffer,
        })
    }
}

/// What the pipeline needs to re-encode an image the way it arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSource {
    pub transport: ImageTransport,
    pub header: Header,
    /// The recorded message of raw images; `None` for compressed ones.
    pub raw: Option<RawImage>,
}

impl ImageSource {
    /// Pixel encoding of raw images.
    pub fn encoding(&self) -> Option<PixelEncoding> {
        self.raw.as_ref().and_then(|raw| raw.pixel_encoding().ok())
    }
}

/// Decode an image message into a canonical frame.
///
/// Returns `Ok(None)` when the message is not an image.
pub fn decode_image(message: &BagMessage) -> Result<Option<(Frame, ImageSource)>, BagError> {
    let Some(transport) = message.transport() else {
        return Ok(None);
    };
    let decoded = match transport {
        ImageTransport::Compressed => {
            let msg = CompressedImage::from_cdr(&message.data)?;
            let frame = msg.to_frame()?;
            (
                frame,
                ImageSource {
                    transport,
                    header: msg.header,
                    raw: None,
                },
            )
        }
        ImageTransport::Raw => {
            let msg = RawImage::from_cdr(&message.data)?;
            let frame = msg.to_frame()?;
            (
                frame,
                ImageSource {
                    transport,
                    header: msg.header.clone(),
                    raw: Some(msg),
                },
            )
        }
    };
    Ok(Some(decoded))
}

pub fn frame_to_rgb_image(frame: &Frame) -> RgbImage {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    RgbImage::from_raw(frame.width, frame.height, rgb)
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height))
}

pub fn rgb_image_to_frame(rgb: &RgbImage) -> Frame {
    let mut data = Vec::with_capacity(rgb.as_raw().len());
    for px in rgb.as_raw().chunks_exact(3) {
        data.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    Frame {
        data,
        width: rgb.width(),
        height: rgb.height(),
    }
}
