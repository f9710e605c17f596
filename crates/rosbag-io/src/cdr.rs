//! Minimal CDR (XCDR1) reader and writer covering the primitives used by the
//! `sensor_msgs` image messages.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::types::BagError;

const ENCAPSULATION_LEN: usize = 4;
const CDR_LE_HEADER: [u8; ENCAPSULATION_LEN] = [0x00, 0x01, 0x00, 0x00];

pub(crate) struct CdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> CdrReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Result<Self, BagError> {
        if buf.len() < ENCAPSULATION_LEN {
            return Err(BagError::Cdr("payload shorter than encapsulation header".into()));
        }
        let big_endian = match buf[1] {
            0x00 | 0x02 => true,
            0x01 | 0x03 => false,
            kind => {
                return Err(BagError::Cdr(format!(
                    "unknown encapsulation kind {kind:#04x}"
                )));
            }
        };
        Ok(Self {
            buf,
            pos: ENCAPSULATION_LEN,
            big_endian,
        })
    }

    pub(crate) fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    fn align(&mut self, n: usize) {
        let rel = self.pos - ENCAPSULATION_LEN;
        self.pos += (n - rel % n) % n;
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BagError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                BagError::Cdr(format!(
                    "need {len} bytes at offset {}, payload is {} bytes",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, BagError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, BagError> {
        self.align(4);
        let bytes = self.take(4)?;
        Ok(if self.big_endian {
            BigEndian::read_u32(bytes)
        } else {
            LittleEndian::read_u32(bytes)
        })
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, BagError> {
        Ok(self.read_u32()? as i32)
    }

    pub(crate) fn read_string(&mut self) -> Result<String, BagError> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.take(len)?;
        let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        String::from_utf8(text.to_vec())
            .map_err(|err| BagError::Cdr(format!("string is not UTF-8: {err}")))
    }

    pub(crate) fn read_byte_sequence(&mut self) -> Result<&'a [u8], BagError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

/// Little-endian CDR writer.
pub(crate) struct CdrWriter {
    buf: Vec<u8>,
}

impl CdrWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + ENCAPSULATION_LEN);
        buf.extend_from_slice(&CDR_LE_HEADER);
        Self { buf }
    }

    fn align(&mut self, n: usize) {
        let rel = self.buf.len() - ENCAPSULATION_LEN;
        let pad = (n - rel % n) % n;
        self.buf.resize(self.buf.len() + pad, 0);
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.align(4);
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, v);
        self.buf.extend_from_slice(&bytes);
    }

    pub(crate) fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub(crate) fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32 + 1);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn write_byte_sequence(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}
