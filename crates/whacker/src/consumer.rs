//! Drain side of the pipeline.
//!
//! Takes descriptors from the metadata queue in order and turns each into a
//! frame: a header built at dequeue time, followed by the payload read
//! straight out of the ring. Emits at most one byte per tick, and only while
//! the sink is ready.

use tracing::trace;

use crate::config::FILLER_TIMEOUT;
use crate::descriptor::PacketDescriptor;
use crate::frame::{FILLER_MAGIC, Header};
use crate::queue::BoundedQueue;
use crate::ring::ReadPort;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConsumerState {
    Idle,
    Header { header: Header, index: usize, remaining: usize },
    Payload { remaining: usize },
    Filler,
}

pub struct Consumer {
    state: ConsumerState,
    read_cursor: usize,
    previous_timestamp: Option<u64>,
    odd: bool,
    idle_ticks: u64,
    filler_timeout: u64,
    frames: u64,
    skipped: u64,
    fillers: u64,
}

impl Default for Consumer {
    fn default() -> Self {
        Consumer::new(FILLER_TIMEOUT)
    }
}

impl Consumer {
    pub fn new(filler_timeout: u64) -> Consumer {
        Consumer {
            state: ConsumerState::Idle,
            read_cursor: 0,
            previous_timestamp: None,
            odd: false,
            idle_ticks: 0,
            filler_timeout,
            frames: 0,
            skipped: 0,
            fillers: 0,
        }
    }

    /// Ring offset up to which everything has been drained. Published to
    /// the producer as its watermark.
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConsumerState::Idle
    }

    /// Whether an odd number of bytes has gone out since the last filler.
    pub fn filler_due(&self) -> bool {
        self.odd
    }

    /// Frames emitted, including those sent with the discarded magic.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Discarded packets skipped without output.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn fillers(&self) -> u64 {
        self.fillers
    }

    /// Advance one tick, returning the byte sent to the sink, if any.
    pub fn step(
        &mut self,
        queue: &mut BoundedQueue<PacketDescriptor>,
        ring: &ReadPort<'_>,
        debug_discard: bool,
        sink_ready: bool,
    ) -> Option<u8> {
        if self.state == ConsumerState::Idle {
            match queue.pop() {
                Some(desc) => {
                    self.idle_ticks = 0;
                    self.dequeue(&desc, ring, debug_discard);
                }
                None => {
                    if self.odd {
                        self.idle_ticks += 1;
                        if self.idle_ticks >= self.filler_timeout {
                            self.state = ConsumerState::Filler;
                        }
                    } else {
                        self.idle_ticks = 0;
                    }
                }
            }
        }

        if !sink_ready {
            return None;
        }

        let byte = match &mut self.state {
            ConsumerState::Idle => return None,
            ConsumerState::Header {
                header,
                index,
                remaining,
            } => {
                let byte = header.as_bytes()[*index];
                *index += 1;
                if *index == header.len() {
                    let remaining = *remaining;
                    self.state = match remaining {
                        0 => ConsumerState::Idle,
                        remaining => ConsumerState::Payload { remaining },
                    };
                }
                byte
            }
            ConsumerState::Payload { remaining } => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.state = ConsumerState::Idle;
                }
                let byte = ring.read(self.read_cursor);
                self.read_cursor = ring.wrap(self.read_cursor + 1);
                byte
            }
            ConsumerState::Filler => {
                trace!("sending filler");
                self.fillers += 1;
                self.idle_ticks = 0;
                self.state = ConsumerState::Idle;
                FILLER_MAGIC
            }
        };
        self.odd = !self.odd;
        Some(byte)
    }

    fn dequeue(&mut self, desc: &PacketDescriptor, ring: &ReadPort<'_>, debug_discard: bool) {
        let len = usize::from(desc.captured_len());

        if desc.discard && !debug_discard {
            trace!(timestamp = desc.timestamp, len, "skipping discarded packet");
            self.read_cursor = ring.wrap(desc.start + len);
            self.skipped += 1;
            return;
        }

        // The very first frame has nothing to be relative to.
        let delta = match self.previous_timestamp {
            Some(previous) => desc.timestamp.wrapping_sub(previous),
            None => 0,
        };
        self.previous_timestamp = Some(desc.timestamp);

        let header = Header::encode(desc, delta, desc.discard);
        trace!(
            timestamp = desc.timestamp,
            delta,
            len,
            discard = desc.discard,
            "sending frame"
        );
        self.read_cursor = ring.wrap(desc.start);
        self.frames += 1;
        self.state = ConsumerState::Header {
            header,
            index: 0,
            remaining: len,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Flags;
    use crate::ring::RingBuffer;

    fn ring_with(start: usize, bytes: &[u8]) -> RingBuffer {
        let mut ring = RingBuffer::new(2048);
        let mut port = ring.writer();
        for (index, byte) in bytes.iter().enumerate() {
            port.write(start + index, *byte);
        }
        ring
    }

    fn packet(timestamp: u64, start: usize, count: u16) -> PacketDescriptor {
        PacketDescriptor {
            timestamp,
            start,
            count,
            ..Default::default()
        }
    }

    /// Run until the queue is empty and the last frame has gone out.
    fn drain(
        consumer: &mut Consumer,
        queue: &mut BoundedQueue<PacketDescriptor>,
        ring: &RingBuffer,
        debug_discard: bool,
    ) -> Vec<u8> {
        let mut output = Vec::new();
        for _ in 0..4096 {
            output.extend(consumer.step(queue, &ring.reader(), debug_discard, true));
            if queue.is_empty() && consumer.is_idle() {
                break;
            }
        }
        output
    }

    #[test]
    fn frames_in_order() {
        let ring = ring_with(12, &[0xD2, 0x69, 0x82, 0x18]);
        let mut queue = BoundedQueue::new(8);
        queue.push(packet(1000, 12, 1)).unwrap();
        queue.push(packet(1020, 13, 3)).unwrap();

        let mut consumer = Consumer::default();
        let output = drain(&mut consumer, &mut queue, &ring, false);
        assert_eq!(
            output,
            [
                0xA0, 0x00, 0x01, 0x00, 0x00, 0xD2, // first frame, delta 0
                0xA0, 0x00, 0x03, 0x00, 0x14, 0x69, 0x82, 0x18,
            ]
        );
        assert_eq!(consumer.read_cursor(), 16);
        assert_eq!(consumer.frames(), 2);
    }

    #[test]
    fn skipped_packets_leave_the_chain() {
        let ring = ring_with(0, &[0xA5, 0x00, 0x10]);
        let mut queue = BoundedQueue::new(8);
        queue.push(packet(100, 0, 0)).unwrap();
        let mut sof = packet(200, 0, 3);
        sof.discard = true;
        queue.push(sof).unwrap();
        queue.push(packet(300, 3, 0)).unwrap();

        let mut consumer = Consumer::default();
        let output = drain(&mut consumer, &mut queue, &ring, false);
        assert_eq!(
            output,
            [0xA0, 0x00, 0x00, 0x00, 0x00, 0xA0, 0x00, 0x00, 0x00, 0xC8]
        );
        assert_eq!(consumer.skipped(), 1);
        assert_eq!(consumer.read_cursor(), 3);
    }

    #[test]
    fn debug_discard_marks_frame() {
        let ring = ring_with(0, &[0xA5, 0x00, 0x10]);
        let mut queue = BoundedQueue::new(8);
        let mut sof = packet(7, 0, 3);
        sof.discard = true;
        queue.push(sof).unwrap();

        let mut consumer = Consumer::default();
        let output = drain(&mut consumer, &mut queue, &ring, true);
        assert_eq!(output, [0xA2, 0x00, 0x03, 0x00, 0x00, 0xA5, 0x00, 0x10]);
    }

    #[test]
    fn truncated_header() {
        let ring = RingBuffer::new(2048);
        let mut queue = BoundedQueue::new(8);
        let mut desc = packet(0, 0, 2000);
        desc.flags.set_ovf(true);
        queue.push(desc).unwrap();

        let mut consumer = Consumer::default();
        let output = drain(&mut consumer, &mut queue, &ring, false);
        assert_eq!(&output[..5], [0xA0, 0x0A, 0x03, 0x04, 0x00]);
        assert_eq!(output.len(), 5 + 1027);
    }

    #[test]
    fn waits_for_sink() {
        let ring = ring_with(0, &[0xD2]);
        let mut queue = BoundedQueue::new(8);
        queue.push(packet(0, 0, 1)).unwrap();

        let mut consumer = Consumer::default();
        for _ in 0..10 {
            assert_eq!(consumer.step(&mut queue, &ring.reader(), false, false), None);
        }
        assert!(queue.is_empty());
        assert_eq!(consumer.read_cursor(), 0);
        let output = drain(&mut consumer, &mut queue, &ring, false);
        assert_eq!(output, [0xA0, 0x00, 0x01, 0x00, 0x00, 0xD2]);
        assert_eq!(consumer.read_cursor(), 1);
    }

    #[test]
    fn filler_after_odd_output() {
        let ring = RingBuffer::new(2048);
        let mut queue = BoundedQueue::new(8);
        let mut flags = Flags::default();
        flags.set_first(true);
        queue.push(PacketDescriptor::stuff(0, 0, flags)).unwrap();

        let mut consumer = Consumer::new(10);
        let output = drain(&mut consumer, &mut queue, &ring, false);
        assert_eq!(output.len(), 5);
        assert!(consumer.filler_due());

        let mut idle = Vec::new();
        for _ in 0..9 {
            idle.extend(consumer.step(&mut queue, &ring.reader(), false, true));
        }
        assert!(idle.is_empty());
        assert_eq!(
            consumer.step(&mut queue, &ring.reader(), false, true),
            Some(FILLER_MAGIC)
        );
        assert!(!consumer.filler_due());
        for _ in 0..100 {
            assert_eq!(consumer.step(&mut queue, &ring.reader(), false, true), None);
        }
        assert_eq!(consumer.fillers(), 1);
    }

    #[test]
    fn no_filler_after_even_output() {
        let ring = RingBuffer::new(2048);
        let mut queue = BoundedQueue::new(8);
        queue.push(packet(0, 0, 1)).unwrap();

        let mut consumer = Consumer::new(10);
        drain(&mut consumer, &mut queue, &ring, false);
        for _ in 0..100 {
            assert_eq!(consumer.step(&mut queue, &ring.reader(), false, true), None);
        }
    }
}
