use byteorder::{ByteOrder, LittleEndian};

use crate::{
    codec::{CodecError, CodecResult},
    time::{Duration, Time},
};

/// Cursor over a borrowed byte slice with explicit bounds pre-checks.
///
/// Every array decoder first checks the cheap lower bound for the declared
/// element count before touching individual elements. For strings the lower
/// bound is the 4-byte length prefix per element, which deliberately
/// under-checks empty strings; the inner decode re-checks exactly.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Verify that `size` bytes could still be read. Negative sizes are
    /// rejected before any length arithmetic happens.
    pub fn check_size(&self, size: i64) -> CodecResult<()> {
        if size < 0 {
            return Err(CodecError::NegativeSize(size));
        }

        if (self.remaining() as i64) < size {
            return Err(CodecError::ShortBuffer {
                needed: size as usize,
                remaining: self.remaining(),
            });
        }

        Ok(())
    }

    fn take(&mut self, count: usize) -> CodecResult<&'a [u8]> {
        self.check_size(count as i64)?;

        let chunk = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(chunk)
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0x00)
    }

    pub fn read_i8(&mut self) -> CodecResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> CodecResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> CodecResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> CodecResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> CodecResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Strings are a u32 length prefix followed by raw bytes. The payload is
    /// not required to be valid UTF-8; invalid sequences are replaced.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let length = self.read_u32()?;
        let raw = self.read_u8_array(length as i64)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn read_time(&mut self) -> CodecResult<Time> {
        Ok(Time {
            sec: self.read_u32()?,
            nsec: self.read_u32()?,
        })
    }

    pub fn read_duration(&mut self) -> CodecResult<Duration> {
        Ok(Duration {
            sec: self.read_u32()?,
            nsec: self.read_u32()?,
        })
    }

    pub fn read_bool_array(&mut self, count: i64) -> CodecResult<Vec<bool>> {
        self.check_size(count)?;
        (0..count).map(|_| self.read_bool()).collect()
    }

    pub fn read_i8_array(&mut self, count: i64) -> CodecResult<Vec<i8>> {
        self.check_size(count)?;
        (0..count).map(|_| self.read_i8()).collect()
    }

    pub fn read_u8_array(&mut self, count: i64) -> CodecResult<Vec<u8>> {
        self.check_size(count)?;
        Ok(self.take(count as usize)?.to_vec())
    }

    pub fn read_i16_array(&mut self, count: i64) -> CodecResult<Vec<i16>> {
        self.check_size(count.saturating_mul(2))?;
        (0..count).map(|_| self.read_i16()).collect()
    }

    pub fn read_u16_array(&mut self, count: i64) -> CodecResult<Vec<u16>> {
        self.check_size(count.saturating_mul(2))?;
        (0..count).map(|_| self.read_u16()).collect()
    }

    pub fn read_i32_array(&mut self, count: i64) -> CodecResult<Vec<i32>> {
        self.check_size(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_i32()).collect()
    }

    pub fn read_u32_array(&mut self, count: i64) -> CodecResult<Vec<u32>> {
        self.check_size(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_u32()).collect()
    }

    pub fn read_i64_array(&mut self, count: i64) -> CodecResult<Vec<i64>> {
        self.check_size(count.saturating_mul(8))?;
        (0..count).map(|_| self.read_i64()).collect()
    }

    pub fn read_u64_array(&mut self, count: i64) -> CodecResult<Vec<u64>> {
        self.check_size(count.saturating_mul(8))?;
        (0..count).map(|_| self.read_u64()).collect()
    }

    pub fn read_f32_array(&mut self, count: i64) -> CodecResult<Vec<f32>> {
        self.check_size(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_f32()).collect()
    }

    pub fn read_f64_array(&mut self, count: i64) -> CodecResult<Vec<f64>> {
        self.check_size(count.saturating_mul(8))?;
        (0..count).map(|_| self.read_f64()).collect()
    }

    pub fn read_string_array(&mut self, count: i64) -> CodecResult<Vec<String>> {
        // Minimum string size on the wire is its 4-byte length prefix.
        self.check_size(count.saturating_mul(4))?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_time_array(&mut self, count: i64) -> CodecResult<Vec<Time>> {
        self.check_size(count.saturating_mul(8))?;
        (0..count).map(|_| self.read_time()).collect()
    }

    pub fn read_duration_array(&mut self, count: i64) -> CodecResult<Vec<Duration>> {
        self.check_size(count.saturating_mul(8))?;
        (0..count).map(|_| self.read_duration()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_decode_little_endian() {
        let mut reader = ByteReader::new(&[0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);

        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0x12345678);
        assert!(reader.is_empty());
    }

    #[test]
    fn short_buffer_is_reported() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);

        assert!(matches!(
            reader.read_u32(),
            Err(CodecError::ShortBuffer {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn negative_count_is_rejected() {
        let mut reader = ByteReader::new(&[]);

        assert!(matches!(
            reader.read_u8_array(-1),
            Err(CodecError::NegativeSize(-1))
        ));
    }

    #[test]
    fn string_decode_reads_length_prefix() {
        let mut reader = ByteReader::new(&[0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(reader.read_string().unwrap(), "hello");
    }

    #[test]
    fn string_array_precheck_uses_prefix_size() {
        // Two elements require at least 8 bytes of length prefixes; 7 must fail
        // before any element is decoded.
        let mut reader = ByteReader::new(&[0u8; 7]);
        assert!(matches!(
            reader.read_string_array(2),
            Err(CodecError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn time_decodes_two_u32s() {
        let mut reader =
            ByteReader::new(&[0xe8, 0x03, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00]);

        assert_eq!(reader.read_time().unwrap(), Time::new(1000, 42));
    }
}
