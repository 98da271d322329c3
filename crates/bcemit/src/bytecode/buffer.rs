//! Growable code buffer with little-endian immediate accessors.

use crate::error::EmitResult;

/// Capacity of the first allocation made for an empty buffer.
pub(crate) const BYTECODE_CHUNK_LENGTH: usize = 1024;

/// Append-only bytecode store.
///
/// Offsets handed out by `reserve` are byte indexes from the start of the
/// buffer and stay meaningful across growth; only the relocation pass run
/// by the span-dependency resolver moves bytes after they are written.
#[derive(Debug, Default, Clone)]
pub(crate) struct Bytecode {
    bytes: Vec<u8>,
}

impl Bytecode {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Makes room for `delta` more bytes and returns the offset they will start at.
    ///
    /// Capacity doubles on overflow, or jumps to the next power of two above
    /// the requested length when doubling is not enough.
    pub fn reserve(&mut self, delta: usize) -> EmitResult<usize> {
        let offset = self.bytes.len();
        let min_length = offset + delta;
        let capacity = self.bytes.capacity();
        if min_length > capacity {
            let mut new_length = if capacity == 0 {
                BYTECODE_CHUNK_LENGTH
            } else {
                capacity * 2
            };
            if new_length < min_length {
                new_length = min_length.next_power_of_two();
            }
            self.bytes.try_reserve_exact(new_length - offset)?;
        }
        Ok(offset)
    }

    /// Appends `bytes`, growing the buffer first.
    pub fn push(&mut self, bytes: &[u8]) -> EmitResult<usize> {
        let offset = self.reserve(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(offset)
    }

    /// Appends `count` zero bytes.
    pub fn push_zeroed(&mut self, count: usize) -> EmitResult<usize> {
        let offset = self.reserve(count)?;
        self.bytes.resize(offset + count, 0);
        Ok(offset)
    }

    /// Grows the buffer to exactly `length` bytes, zero-filling the tail.
    ///
    /// Used once code generation is over, so no power-of-two rounding.
    pub fn grow_to(&mut self, length: usize) -> EmitResult<()> {
        if length > self.bytes.len() {
            self.bytes.try_reserve_exact(length - self.bytes.len())?;
            self.bytes.resize(length, 0);
        }
        Ok(())
    }

    pub fn byte(&self, at: usize) -> u8 {
        self.bytes[at]
    }

    pub fn set_byte(&mut self, at: usize, value: u8) {
        self.bytes[at] = value;
    }

    pub fn read_i16(&self, at: usize) -> i16 {
        get_i16(&self.bytes, at)
    }

    pub fn read_u16(&self, at: usize) -> u16 {
        get_u16(&self.bytes, at)
    }

    pub fn write_i16(&mut self, at: usize, value: i16) {
        self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, at: usize, value: u16) {
        self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, at: usize, value: i32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn copy_within(&mut self, src: std::ops::Range<usize>, dest: usize) {
        self.bytes.copy_within(src, dest);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

pub(crate) fn get_i16(code: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([code[at], code[at + 1]])
}

pub(crate) fn get_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

pub(crate) fn get_i32(code: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_growth_allocates_a_chunk_then_doubles() {
        let mut code = Bytecode::new();
        assert_eq!(code.push(&[1, 2, 3]).unwrap(), 0);
        assert!(code.capacity() >= BYTECODE_CHUNK_LENGTH);
        let first = code.capacity();
        code.push_zeroed(first - 3).unwrap();
        code.push(&[9]).unwrap();
        assert!(code.capacity() >= first * 2);
        assert_eq!(code.len(), first + 1);
    }

    #[test]
    fn large_request_rounds_to_power_of_two() {
        let mut code = Bytecode::new();
        code.push_zeroed(5000).unwrap();
        assert!(code.capacity() >= 8192);
    }

    #[test]
    fn immediates_are_little_endian() {
        let mut code = Bytecode::new();
        code.push_zeroed(6).unwrap();
        code.write_i16(0, -2);
        code.write_i32(2, 0x0102_0304);
        assert_eq!(code.as_slice(), &[0xfe, 0xff, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(code.read_i16(0), -2);
        assert_eq!(get_i32(code.as_slice(), 2), 0x0102_0304);
    }
}
