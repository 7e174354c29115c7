use byteorder::{LittleEndian, WriteBytesExt};

use crate::time::{Duration, Time};

/// Growable little-endian output buffer.
///
/// Writes cannot fail (the backing store is a `Vec`), so the writer exposes
/// an infallible API; fallibility lives entirely on the decode side.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(if value { 0x01 } else { 0x00 });
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf
            .write_i16::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf
            .write_u16::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf
            .write_i32::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf
            .write_u32::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf
            .write_i64::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf
            .write_u64::<LittleEndian>(value)
            .expect("write to Vec is infallible");
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn write_time(&mut self, value: Time) {
        self.write_u32(value.sec);
        self.write_u32(value.nsec);
    }

    pub fn write_duration(&mut self, value: Duration) {
        self.write_u32(value.sec);
        self.write_u32(value.nsec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteReader;

    #[test]
    fn floats_round_trip_bit_exact() {
        let values = [
            0.0_f64,
            -1.5,
            f64::NAN,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::MIN_POSITIVE,
        ];

        let mut writer = ByteWriter::new();
        for value in values {
            writer.write_f64(value);
        }

        let encoded = writer.into_vec();
        let mut reader = ByteReader::new(&encoded);

        for value in values {
            let decoded = reader.read_f64().unwrap();
            assert_eq!(decoded.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn string_encodes_length_prefix() {
        let mut writer = ByteWriter::new();
        writer.write_string("abc");

        assert_eq!(writer.into_vec(), vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn time_encodes_sec_then_nsec() {
        let mut writer = ByteWriter::new();
        writer.write_time(Time::new(1000, 42));

        assert_eq!(
            writer.into_vec(),
            vec![0xe8, 0x03, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00]
        );
    }
}
