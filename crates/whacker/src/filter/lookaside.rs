//! Look-aside classifiers, fed captured bytes while a packet is ingested.
//!
//! The producer resets every classifier at start-of-packet, feeds it each
//! byte stored in the ring, and once the packet has closed waits until all
//! of them are done. If any rejects, the descriptor leaves the producer with
//! `discard` already set.

use anyhow::bail;

use crate::Result;
use crate::descriptor::MAX_PACKET_SIZE;
use crate::usb::validate_packet;

pub trait LookAside: Send {
    /// Forget the previous packet.
    fn reset(&mut self);

    /// Observe the next captured byte.
    fn feed(&mut self, byte: u8);

    /// Called once per tick while the producer waits for a verdict.
    fn tick(&mut self) {}

    fn is_done(&self) -> bool;

    fn is_reject(&self) -> bool;
}

/// All classifiers attached to a producer.
#[derive(Default)]
pub struct LookAsideSet {
    filters: Vec<Box<dyn LookAside>>,
}

impl LookAsideSet {
    pub fn push(&mut self, filter: Box<dyn LookAside>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn reset(&mut self) {
        self.filters.iter_mut().for_each(|f| f.reset());
    }

    pub fn feed(&mut self, byte: u8) {
        self.filters.iter_mut().for_each(|f| f.feed(byte));
    }

    pub fn tick(&mut self) {
        self.filters.iter_mut().for_each(|f| f.tick());
    }

    pub fn is_done(&self) -> bool {
        self.filters.iter().all(|f| f.is_done())
    }

    pub fn is_reject(&self) -> bool {
        self.filters.iter().any(|f| f.is_reject())
    }
}

/// What a [`PatternMatch`] does with packets that match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchAction {
    /// Reject matching packets.
    Reject,
    /// Reject everything except matching packets.
    Keep,
}

const PATTERN_MAX_LEN: usize = 32;

/// Compares packet bytes at a fixed offset against a masked pattern.
#[derive(Clone, Debug)]
pub struct PatternMatch {
    offset: usize,
    pattern: Vec<u8>,
    mask: Vec<u8>,
    action: MatchAction,
    position: usize,
    matched: usize,
    mismatch: bool,
}

impl PatternMatch {
    pub fn new(offset: u16, pattern: &[u8], mask: &[u8], action: MatchAction) -> Result<Self> {
        if pattern.is_empty() {
            bail!("Match pattern must not be empty");
        }
        if pattern.len() > PATTERN_MAX_LEN {
            bail!(
                "Match pattern length ({}) exceeds supported length {PATTERN_MAX_LEN}",
                pattern.len()
            );
        }
        if mask.len() < pattern.len() {
            bail!(
                "Match mask length ({}) is shorter than pattern length ({})",
                mask.len(),
                pattern.len()
            );
        }
        if usize::from(offset) + pattern.len() > usize::from(MAX_PACKET_SIZE) {
            bail!("Match pattern extends beyond the captured packet size");
        }
        Ok(PatternMatch {
            offset: usize::from(offset),
            pattern: pattern.to_vec(),
            mask: mask[..pattern.len()].to_vec(),
            action,
            position: 0,
            matched: 0,
            mismatch: false,
        })
    }

    /// Matches packets whose first byte carries `pid`, check nibble included.
    pub fn pid(pid: crate::usb::Pid, action: MatchAction) -> Self {
        PatternMatch {
            offset: 0,
            pattern: vec![pid.to_byte()],
            mask: vec![0xFF],
            action,
            position: 0,
            matched: 0,
            mismatch: false,
        }
    }

    fn is_match(&self) -> bool {
        !self.mismatch && self.matched == self.pattern.len()
    }
}

impl LookAside for PatternMatch {
    fn reset(&mut self) {
        self.position = 0;
        self.matched = 0;
        self.mismatch = false;
    }

    fn feed(&mut self, byte: u8) {
        if let Some(index) = self.position.checked_sub(self.offset) {
            if index < self.pattern.len() {
                if (byte ^ self.pattern[index]) & self.mask[index] != 0 {
                    self.mismatch = true;
                }
                self.matched += 1;
            }
        }
        self.position += 1;
    }

    fn is_done(&self) -> bool {
        true
    }

    fn is_reject(&self) -> bool {
        match self.action {
            MatchAction::Reject => self.is_match(),
            MatchAction::Keep => !self.is_match(),
        }
    }
}

/// Rejects packets with a bad length or CRC for their PID.
#[derive(Clone, Debug, Default)]
pub struct CrcCheck {
    packet: Vec<u8>,
}

impl LookAside for CrcCheck {
    fn reset(&mut self) {
        self.packet.clear();
    }

    fn feed(&mut self, byte: u8) {
        self.packet.push(byte);
    }

    fn is_done(&self) -> bool {
        true
    }

    fn is_reject(&self) -> bool {
        validate_packet(&self.packet).is_err()
    }
}
