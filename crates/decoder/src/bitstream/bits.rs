//! Bit-level reader and writer for RBSP payloads.
//!
//! Both operate on RBSP bytes, i.e. with emulation prevention removed.
//! Use [`unescape_rbsp`] on NAL payloads before reading and [`escape_rbsp`]
//! on written payloads before they go back into an Annex-B stream.

use super::BitstreamError;

/// Strip `0x03` emulation-prevention bytes from a NAL payload.
pub fn unescape_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zeros = 0usize;
    for &byte in ebsp {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Insert `0x03` wherever two zero bytes would be followed by `0x00..=0x03`.
pub fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0usize;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// MSB-first bit reader with exp-Golomb support.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position in bits from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn read_bit(&mut self) -> Result<bool, BitstreamError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(BitstreamError::Truncated { bit: self.pos })?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read `n` bits (at most 32) as an unsigned value.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, BitstreamError> {
        debug_assert!(n <= 32);
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value as u32)
    }

    pub fn read_u8(&mut self, n: u32) -> Result<u8, BitstreamError> {
        debug_assert!(n <= 8);
        Ok(self.read_bits(n)? as u8)
    }

    /// Unsigned exp-Golomb, `ue(v)`.
    pub fn read_ue(&mut self) -> Result<u32, BitstreamError> {
        let start = self.pos;
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitstreamError::ExpGolombOverflow { bit: start });
            }
        }
        let suffix = u64::from(self.read_bits(leading_zeros)?);
        let value = (1u64 << leading_zeros) - 1 + suffix;
        u32::try_from(value).map_err(|_| BitstreamError::ExpGolombOverflow { bit: start })
    }

    /// Signed exp-Golomb, `se(v)`.
    pub fn read_se(&mut self) -> Result<i32, BitstreamError> {
        let k = i64::from(self.read_ue()?);
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Ok(value as i32)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// MSB-first bit writer with exp-Golomb support.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | u8::from(bit);
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    /// Write the low `n` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32);
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_ue(&mut self, value: u32) {
        let coded = u64::from(value) + 1;
        let len = 64 - coded.leading_zeros();
        for _ in 0..len - 1 {
            self.write_bit(false);
        }
        for i in (0..len).rev() {
            self.write_bit((coded >> i) & 1 == 1);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let v = i64::from(value);
        let k = if v > 0 { 2 * v - 1 } else { -2 * v };
        self.write_ue(k as u32);
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.filled == 0
    }

    /// `rbsp_trailing_bits()`: a stop bit then zero padding to the byte boundary.
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(true);
        while !self.is_byte_aligned() {
            self.write_bit(false);
        }
    }

    /// Finish writing. A partial final byte is zero-padded.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.filled > 0 {
            let pad = 8 - self.filled;
            self.bytes.push(self.current << pad);
        }
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exp_golomb_known_codes() {
        // ue: 0 -> 1, 1 -> 010, 2 -> 011, 3 -> 00100
        let mut w = BitWriter::new();
        w.write_ue(0);
        w.write_ue(1);
        w.write_ue(2);
        w.write_ue(3);
        let bytes = w.into_bytes();
        // 1 010 011 00100 -> 1010 0110 0100 (pad) -> 0xA6 0x40
        assert_eq!(bytes, vec![0xA6, 0x40]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn signed_exp_golomb_mapping() {
        let mut w = BitWriter::new();
        for v in [0, 1, -1, 2, -2, 17, -300] {
            w.write_se(v);
        }
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        for v in [0, 1, -1, 2, -2, 17, -300] {
            assert_eq!(r.read_se().unwrap(), v);
        }
    }

    #[test]
    fn large_ue_values() {
        let mut w = BitWriter::new();
        w.write_ue(u32::MAX - 1);
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_ue().unwrap(), u32::MAX - 1);
    }

    #[test]
    fn reading_past_end_reports_position() {
        let mut r = BitReader::new(&[0xFF]);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert_eq!(r.read_bit(), Err(BitstreamError::Truncated { bit: 8 }));
    }

    #[test]
    fn all_zero_ue_overflows() {
        let data = [0u8; 8];
        let mut r = BitReader::new(&data);
        assert!(matches!(
            r.read_ue(),
            Err(BitstreamError::ExpGolombOverflow { bit: 0 })
        ));
    }

    #[test]
    fn emulation_prevention() {
        let rbsp = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04];
        let escaped = escape_rbsp(&rbsp);
        assert_eq!(
            escaped,
            vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x04]
        );
        assert_eq!(unescape_rbsp(&escaped), rbsp.to_vec());
    }

    #[test]
    fn trailing_bits_align() {
        let mut w = BitWriter::new();
        w.write_bits(0b101, 3);
        w.write_trailing_bits();
        assert!(w.is_byte_aligned());
        assert_eq!(w.into_bytes(), vec![0b1011_0000]);
    }
}
