//! Byte-level primitives shared by the patch codec and snapshot format.
//!
//! Fixed-width integers are little-endian; variable-width integers are
//! unsigned LEB128.

use crate::core::{DecodeError, MetadataValue, SamplePoint, StrokeData};

/// Smallest encoded size of a sample point (all varints one byte).
const MIN_POINT_SIZE: usize = 4 + 4 + 1 + 4 + 4 + 4;

/// Append an unsigned LEB128 varint.
pub(crate) fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a length-prefixed byte string.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub(crate) fn put_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
}

/// Append stroke geometry.
pub(crate) fn put_stroke_data(buf: &mut Vec<u8>, data: &StrokeData) {
    put_varint(buf, data.brush as u64);
    put_varint(buf, data.points.len() as u64);
    for p in &data.points {
        put_f32(buf, p.x);
        put_f32(buf, p.y);
        put_varint(buf, p.t_offset_ms as u64);
        put_f32(buf, p.pressure);
        put_f32(buf, p.tilt_x);
        put_f32(buf, p.tilt_y);
    }
}

/// Append a metadata value (tag byte + payload).
pub(crate) fn put_metadata_value(buf: &mut Vec<u8>, value: &MetadataValue) {
    match value {
        MetadataValue::Cleared => buf.push(0),
        MetadataValue::Text(text) => {
            buf.push(1);
            put_bytes(buf, text.as_bytes());
        }
        MetadataValue::Integer(n) => {
            buf.push(2);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        MetadataValue::Boolean(b) => {
            buf.push(3);
            buf.push(u8::from(*b));
        }
        MetadataValue::Bytes(bytes) => {
            buf.push(4);
            put_bytes(buf, bytes);
        }
    }
}

/// Cursor over an input buffer.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub(crate) fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::InvalidEncoding("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::InvalidEncoding("varint too long".into()));
            }
        }
    }

    /// Varint that must fit a `usize` bounded by `limit`.
    pub(crate) fn length(&mut self, limit: usize) -> Result<usize, DecodeError> {
        let len = self.varint()?;
        if len > limit as u64 {
            return Err(DecodeError::InvalidEncoding(format!(
                "length {len} exceeds limit {limit}"
            )));
        }
        Ok(len as usize)
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.length(self.remaining())?;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidEncoding("string not utf-8".into()))
    }

    pub(crate) fn stroke_data(&mut self) -> Result<StrokeData, DecodeError> {
        let brush = u32::try_from(self.varint()?)
            .map_err(|_| DecodeError::InvalidEncoding("brush id overflow".into()))?;
        let count = self.length(self.remaining() / MIN_POINT_SIZE)?;
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let x = self.f32()?;
            let y = self.f32()?;
            let t_offset_ms = u32::try_from(self.varint()?)
                .map_err(|_| DecodeError::InvalidEncoding("time offset overflow".into()))?;
            let pressure = self.f32()?;
            let tilt_x = self.f32()?;
            let tilt_y = self.f32()?;
            points.push(SamplePoint {
                x,
                y,
                t_offset_ms,
                pressure,
                tilt_x,
                tilt_y,
            });
        }
        Ok(StrokeData { points, brush })
    }

    pub(crate) fn metadata_value(&mut self) -> Result<MetadataValue, DecodeError> {
        match self.u8()? {
            0 => Ok(MetadataValue::Cleared),
            1 => Ok(MetadataValue::Text(self.string()?)),
            2 => {
                let raw = self.u64()?;
                Ok(MetadataValue::Integer(i64::from_le_bytes(raw.to_le_bytes())))
            }
            3 => match self.u8()? {
                0 => Ok(MetadataValue::Boolean(false)),
                1 => Ok(MetadataValue::Boolean(true)),
                other => Err(DecodeError::InvalidEncoding(format!(
                    "invalid boolean byte {other}"
                ))),
            },
            4 => Ok(MetadataValue::Bytes(self.bytes()?.to_vec())),
            tag => Err(DecodeError::InvalidEncoding(format!(
                "unknown metadata value tag {tag}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let mut reader = ByteReader::new(&buf);
            assert_eq!(reader.varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_varint_single_byte_below_128() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
    }

    #[test]
    fn test_varint_overlong_rejected() {
        let buf = [0xffu8; 11];
        let mut reader = ByteReader::new(&buf);
        assert!(matches!(reader.varint(), Err(DecodeError::InvalidEncoding(_))));
    }

    #[test]
    fn test_truncated_read() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert!(matches!(reader.u32(), Err(DecodeError::UnexpectedEof)));
    }

    #[test]
    fn test_length_prefixed_beyond_input() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 50);
        buf.extend_from_slice(b"short");
        let mut reader = ByteReader::new(&buf);
        assert!(reader.bytes().is_err());
    }

    #[test]
    fn test_metadata_value_rejects_bad_bool() {
        let mut reader = ByteReader::new(&[3, 7]);
        assert!(matches!(
            reader.metadata_value(),
            Err(DecodeError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_stroke_data_point_count_bounded_by_input() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 1_000_000);
        let mut reader = ByteReader::new(&buf);
        assert!(reader.stroke_data().is_err());
    }
}
