//! H.264 bitstream writing helpers
//!
//! Bit-level RBSP writer with Exp-Golomb codes and NAL unit framing
//! (Annex B start codes and emulation prevention).

/// Annex B start code
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types used by the software encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalType {
    Slice = 1,
    IdrSlice = 5,
    Sps = 7,
    Pps = 8,
}

/// MSB-first bit writer
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            current: 0,
            used: 0,
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    /// Write the low `count` bits of `value`, most significant first
    pub fn put_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    /// Unsigned Exp-Golomb, ue(v)
    pub fn put_ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros() as u8;
        for _ in 0..len - 1 {
            self.put_bit(false);
        }
        for i in (0..len).rev() {
            self.put_bit((code >> i) & 1 == 1);
        }
    }

    /// Signed Exp-Golomb, se(v)
    pub fn put_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            (-(value as i64) as u32) * 2
        };
        self.put_ue(mapped);
    }

    pub fn is_aligned(&self) -> bool {
        self.used == 0
    }

    /// Zero bits up to the next byte boundary
    pub fn align_zero(&mut self) {
        while !self.is_aligned() {
            self.put_bit(false);
        }
    }

    /// Append whole bytes; the writer must be aligned
    pub fn put_bytes(&mut self, data: &[u8]) {
        debug_assert!(self.is_aligned());
        self.bytes.extend_from_slice(data);
    }

    /// rbsp_trailing_bits: a stop bit then zero alignment
    pub fn trailing_bits(&mut self) {
        self.put_bit(true);
        self.align_zero();
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.align_zero();
        self.bytes
    }
}

/// Frame a payload as an Annex B NAL unit, inserting emulation prevention
/// bytes wherever two zero bytes are followed by a byte <= 3.
pub fn write_nal(out: &mut Vec<u8>, nal_ref_idc: u8, nal_type: NalType, rbsp: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.push((nal_ref_idc & 0x3) << 5 | nal_type as u8);

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
}

/// Split an Annex B stream into NAL units (without start codes)
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(next) => next - 3,
            None => data.len(),
        };
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        units.push(&data[start..end]);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ue_codes() {
        let mut w = BitWriter::new();
        // 0 -> 1, 1 -> 010, 2 -> 011, 3 -> 00100
        w.put_ue(0);
        w.put_ue(1);
        w.put_ue(2);
        w.put_ue(3);
        // 1 010 011 00100 -> 1010 0110 0100 (pad) -> 0xA6 0x40
        assert_eq!(w.into_bytes(), vec![0xA6, 0x40]);
    }

    #[test]
    fn test_se_codes() {
        let mut w = BitWriter::new();
        // se: 0 -> ue(0), 1 -> ue(1), -1 -> ue(2)
        w.put_se(0);
        w.put_se(1);
        w.put_se(-1);
        // 1 010 011 -> 1010 011(0) -> 0xA6
        assert_eq!(w.into_bytes(), vec![0xA6]);
    }

    #[test]
    fn test_trailing_bits() {
        let mut w = BitWriter::new();
        w.put_bits(0b101, 3);
        w.trailing_bits();
        assert!(w.is_aligned());
        assert_eq!(w.into_bytes(), vec![0b1011_0000]);
    }

    #[test]
    fn test_emulation_prevention() {
        let mut out = Vec::new();
        write_nal(&mut out, 3, NalType::IdrSlice, &[0, 0, 1, 0, 0, 0, 5]);
        assert_eq!(&out[..4], &START_CODE);
        assert_eq!(out[4], 0x65);
        assert_eq!(&out[5..], &[0, 0, 3, 1, 0, 0, 3, 0, 5]);
    }

    #[test]
    fn test_split_nal_units() {
        let mut out = Vec::new();
        write_nal(&mut out, 3, NalType::Sps, &[1, 2]);
        write_nal(&mut out, 3, NalType::Pps, &[3]);
        let units = split_nal_units(&out);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x67, 1, 2]);
        assert_eq!(units[1], &[0x68, 3]);
    }
}
