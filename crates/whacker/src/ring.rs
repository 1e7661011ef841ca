//! The byte ring shared by the producer and the consumer.
//!
//! The producer only ever holds a [`WritePort`] and the consumer only a
//! [`ReadPort`]. Neither holds a reference to the other's cursor; the
//! consumer's read position reaches the producer as a plain offset, the
//! watermark, from which [`WritePort::has_space`] derives admission.

use crate::frame::MAX_HEADER_SIZE;

pub struct RingBuffer {
    mem: Box<[u8]>,
    mask: usize,
}

impl RingBuffer {
    /// Creates a zeroed ring of `depth` bytes. `depth` must be a power of two.
    pub fn new(depth: usize) -> RingBuffer {
        debug_assert!(depth.is_power_of_two());
        RingBuffer {
            mem: vec![0; depth].into_boxed_slice(),
            mask: depth - 1,
        }
    }

    pub fn depth(&self) -> usize {
        self.mem.len()
    }

    pub fn writer(&mut self) -> WritePort<'_> {
        WritePort { ring: self }
    }

    pub fn reader(&self) -> ReadPort<'_> {
        ReadPort { ring: self }
    }

    /// Bytes that may be written at `write` without reaching `watermark`.
    pub fn free_space(&self, write: usize, watermark: usize) -> usize {
        watermark.wrapping_sub(write).wrapping_sub(1) & self.mask
    }

    /// Whether more than a worst-case header of space lies ahead of `write`.
    pub fn has_space(&self, write: usize, watermark: usize) -> bool {
        self.free_space(write, watermark) > MAX_HEADER_SIZE
    }

    pub fn wrap(&self, offset: usize) -> usize {
        offset & self.mask
    }
}

/// Producer access: random-access writes.
pub struct WritePort<'a> {
    ring: &'a mut RingBuffer,
}

impl WritePort<'_> {
    pub fn write(&mut self, offset: usize, byte: u8) {
        let index = offset & self.ring.mask;
        self.ring.mem[index] = byte;
    }

    pub fn has_space(&self, write: usize, watermark: usize) -> bool {
        self.ring.has_space(write, watermark)
    }

    pub fn wrap(&self, offset: usize) -> usize {
        self.ring.wrap(offset)
    }
}

/// Consumer access: reads at the consumer's own cursor.
pub struct ReadPort<'a> {
    ring: &'a RingBuffer,
}

impl ReadPort<'_> {
    pub fn read(&self, offset: usize) -> u8 {
        self.ring.mem[offset & self.ring.mask]
    }

    pub fn wrap(&self, offset: usize) -> usize {
        self.ring.wrap(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_space_wraps() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.free_space(0, 0), 15);
        assert_eq!(ring.free_space(4, 10), 5);
        assert_eq!(ring.free_space(10, 4), 9);
        assert_eq!(ring.free_space(15, 0), 0);
    }

    #[test]
    fn writes_are_visible_to_reader() {
        let mut ring = RingBuffer::new(2048);
        {
            let mut port = ring.writer();
            port.write(2047, 0xAA);
            port.write(2048, 0xBB);
        }
        let port = ring.reader();
        assert_eq!(port.read(2047), 0xAA);
        assert_eq!(port.read(0), 0xBB);
    }

    #[test]
    fn admission_margin() {
        let mut ring = RingBuffer::new(2048);
        let port = ring.writer();
        assert!(port.has_space(0, 0));
        // Exactly a header's worth of space is not enough.
        assert!(!port.has_space(100, 100 + MAX_HEADER_SIZE + 1));
        assert!(port.has_space(100, 100 + MAX_HEADER_SIZE + 2));
    }
}
