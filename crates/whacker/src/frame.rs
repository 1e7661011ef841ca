//! The framed byte stream sent to the host.
//!
//! ```text
//! A0 | A2   magic (A2: discarded packet, debug mode)
//! F0        flags
//! SL SH     packet size (lower 13 bits) and delta timestamp size (upper 3 bits)
//! T0 .. Tn  delta timestamp from previous frame, n = delta timestamp size
//! d0 .. dN  captured USB packet data
//! ```
//!
//! A lone `A1` between frames is filler and carries nothing.

use std::collections::VecDeque;

use thiserror::Error;

use crate::descriptor::{Flags, PacketDescriptor};

pub const MAGIC_PACKET: u8 = 0xA0;
pub const MAGIC_DISCARDED: u8 = 0xA2;
pub const FILLER_MAGIC: u8 = 0xA1;

/// Magic, flags, two size bytes and up to eight timestamp bytes.
pub const MAX_HEADER_SIZE: usize = 12;

const SIZE_MASK: u16 = 0x1FFF;
const TS_SIZE_SHIFT: u32 = 13;

/// Number of timestamp bytes beyond the first needed to hold `delta`.
pub fn delta_ts_size(delta: u64) -> u8 {
    let bits = 64 - delta.leading_zeros();
    (bits.div_ceil(8).max(1) - 1) as u8
}

/// A frame header, built at the moment the consumer starts sending it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    bytes: [u8; MAX_HEADER_SIZE],
    len: usize,
}

impl Header {
    pub fn encode(desc: &PacketDescriptor, delta: u64, discarded: bool) -> Header {
        let mut bytes = [0; MAX_HEADER_SIZE];
        let ts_size = delta_ts_size(delta);
        let size = (desc.captured_len() & SIZE_MASK) | (u16::from(ts_size) << TS_SIZE_SHIFT);

        bytes[0] = if discarded { MAGIC_DISCARDED } else { MAGIC_PACKET };
        bytes[1] = desc.header_flags().bits();
        bytes[2..4].copy_from_slice(&size.to_le_bytes());
        let ts_len = usize::from(ts_size) + 1;
        bytes[4..4 + ts_len].copy_from_slice(&delta.to_le_bytes()[..ts_len]);

        Header {
            bytes,
            len: 4 + ts_len,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Headers always carry at least the magic, flags, size and one delta byte.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A frame recovered from the byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Sent with the debug magic: a filter marked it for discard.
    pub discarded: bool,
    pub flags: Flags,
    /// Absolute timestamp, accumulated from the decoder's origin.
    pub timestamp: u64,
    pub delta: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_truncated(&self) -> bool {
        self.flags.trunc()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected byte {byte:#04x} where a frame header was expected")]
    BadMagic { byte: u8 },
}

/// Converts received stream bytes back into timestamped frames.
pub struct FrameDecoder {
    buffer: VecDeque<u8>,
    timestamp: u64,
    fillers: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::with_origin(0)
    }
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    /// A decoder whose first frame is reported at `origin`.
    pub fn with_origin(origin: u64) -> FrameDecoder {
        FrameDecoder {
            buffer: VecDeque::new(),
            timestamp: origin,
            fillers: 0,
        }
    }

    /// Decode a complete stream in one go. Trailing bytes of an unfinished
    /// frame are ignored.
    pub fn decode(origin: u64, bytes: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        let mut decoder = FrameDecoder::with_origin(origin);
        decoder.push(bytes);
        decoder.collect()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter());
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Filler bytes skipped so far.
    pub fn fillers(&self) -> u64 {
        self.fillers
    }

    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        // Skip any filler ahead of the next header.
        while self.buffer.front() == Some(&FILLER_MAGIC) {
            self.buffer.pop_front();
            self.fillers += 1;
        }

        let magic = *self.buffer.front()?;
        let discarded = match magic {
            MAGIC_PACKET => false,
            MAGIC_DISCARDED => true,
            byte => {
                self.buffer.pop_front();
                return Some(Err(DecodeError::BadMagic { byte }));
            }
        };

        // Do we have the size field yet?
        if self.buffer.len() < 4 {
            return None;
        }
        let size = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
        let ts_len = usize::from(size >> TS_SIZE_SHIFT) + 1;
        let payload_len = usize::from(size & SIZE_MASK);

        // Do we have the whole frame?
        if self.buffer.len() < 4 + ts_len + payload_len {
            return None;
        }

        let flags = Flags::from_bits(self.buffer[1]);
        let mut delta_bytes = [0; 8];
        for (index, byte) in delta_bytes.iter_mut().take(ts_len).enumerate() {
            *byte = self.buffer[4 + index];
        }
        let delta = u64::from_le_bytes(delta_bytes);
        self.buffer.drain(0..(4 + ts_len));
        self.timestamp = self.timestamp.wrapping_add(delta);

        Some(Ok(Frame {
            discarded,
            flags,
            timestamp: self.timestamp,
            delta,
            payload: self.buffer.drain(0..payload_len).collect(),
        }))
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}
