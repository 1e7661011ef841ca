//! The complete pipeline: producer, filters, metadata queue and consumer.

use tracing::{debug, trace, warn};

use crate::config::{Config, PipelineSettings};
use crate::consumer::Consumer;
use crate::descriptor::PacketDescriptor;
use crate::filter::{FilterNak, LookAside, filter_sof};
use crate::producer::{Producer, ProducerState};
use crate::queue::BoundedQueue;
use crate::ring::RingBuffer;
use crate::symbol::Symbol;

/// Counters kept while the pipeline runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Packets captured, not counting session boundaries.
    pub packets: u64,
    /// Session boundary packets.
    pub sessions: u64,
    pub truncated: u64,
    pub errors: u64,
    pub overflows: u64,
    /// Packets marked for discard by a look-aside or a filter stage.
    pub discarded: u64,
    /// Frames sent, including discarded ones sent in debug mode.
    pub frames: u64,
    /// Discarded packets dropped from the output.
    pub skipped: u64,
    pub fillers: u64,
    /// Bytes sent to the sink, filler included.
    pub bytes: u64,
}

/// Result of one pipeline tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// The offered symbol was accepted and must not be offered again.
    pub consumed: bool,
    /// Byte sent to the sink during this tick.
    pub output: Option<u8>,
}

pub struct Whacker {
    config: Config,
    ring: RingBuffer,
    producer: Producer,
    filter_nak: FilterNak,
    queue: BoundedQueue<PacketDescriptor>,
    consumer: Consumer,
    stats: Statistics,
}

impl Default for Whacker {
    fn default() -> Self {
        Whacker::new(&PipelineSettings::default())
    }
}

impl Whacker {
    pub fn new(settings: &PipelineSettings) -> Whacker {
        debug!(
            depth = settings.depth(),
            queue_depth = settings.queue_depth(),
            "creating pipeline"
        );
        Whacker {
            config: settings.config(),
            ring: RingBuffer::new(settings.depth()),
            producer: Producer::new(),
            filter_nak: FilterNak::new(),
            queue: BoundedQueue::new(settings.queue_depth()),
            consumer: Consumer::new(settings.filler_timeout()),
            stats: Statistics::default(),
        }
    }

    /// Attach a look-aside classifier to the producer.
    pub fn add_lookaside(&mut self, filter: Box<dyn LookAside>) {
        self.producer.add_lookaside(filter);
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Change the control register. Takes effect on the next tick.
    pub fn set_config(&mut self, config: Config) {
        if config != self.config {
            debug!(from = ?self.config, to = ?config, "configuration changed");
        }
        self.config = config;
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    /// The consumer's read position, as seen by the producer.
    pub fn read_cursor(&self) -> usize {
        self.consumer.read_cursor()
    }

    pub fn produce_write(&self) -> usize {
        self.producer.produce_write()
    }

    /// The producer is part way through receiving a packet.
    pub fn in_packet(&self) -> bool {
        self.producer.state() == ProducerState::Data
    }

    /// Nothing is in flight between the receiver and the sink.
    pub fn is_drained(&self) -> bool {
        self.producer.is_idle(self.config.enable())
            && self.filter_nak.is_empty()
            && self.queue.is_empty()
            && self.consumer.is_idle()
    }

    /// Advance every stage by one tick.
    ///
    /// `input` is the symbol currently presented by the receiver, `now` the
    /// current tick and `sink_ready` whether the sink accepts a byte.
    pub fn step(&mut self, input: Option<&Symbol>, now: u64, sink_ready: bool) -> Step {
        let config = self.config;

        // Drain first, so the producer sees this tick's watermark.
        let output = self.consumer.step(
            &mut self.queue,
            &self.ring.reader(),
            config.debug_discard(),
            sink_ready,
        );
        if output.is_some() {
            self.stats.bytes += 1;
        }
        self.stats.frames = self.consumer.frames();
        self.stats.skipped = self.consumer.skipped();
        self.stats.fillers = self.consumer.fillers();

        // A held transaction occupies ring space. If the producer is stuck
        // part way through a packet, the packet that would decide the hold
        // can never arrive, so the hold is forwarded as it stands.
        if self.producer.state() == ProducerState::Data
            && self.filter_nak.is_holding()
            && !self
                .ring
                .has_space(self.producer.produce_write(), self.consumer.read_cursor())
        {
            self.filter_nak.release();
        }

        if !self.queue.is_full() {
            if let Some(desc) = self.filter_nak.take() {
                let desc = filter_sof(desc, config.filter_sof());
                trace!(timestamp = desc.timestamp, discard = desc.discard, "queueing");
                match self.queue.push(desc) {
                    Ok(()) if desc.discard => self.stats.discarded += 1,
                    Ok(()) => {}
                    Err(desc) => {
                        warn!(timestamp = desc.timestamp, "metadata queue full, packet lost");
                    }
                }
            }
        }

        if let Some(desc) = self.producer.pending() {
            if self.filter_nak.offer(desc, config.filter_nak()) {
                if let Some(desc) = self.producer.complete_send() {
                    self.count(&desc);
                }
            }
        }

        let watermark = self.consumer.read_cursor();
        let consumed = self.producer.step(
            input,
            now,
            config.enable(),
            watermark,
            &mut self.ring.writer(),
        );

        Step { consumed, output }
    }

    fn count(&mut self, desc: &PacketDescriptor) {
        if desc.is_stuff() {
            self.stats.sessions += 1;
            return;
        }
        self.stats.packets += 1;
        if desc.is_truncated() {
            self.stats.truncated += 1;
        }
        if desc.flags.err() {
            self.stats.errors += 1;
        }
        if desc.flags.ovf() {
            self.stats.overflows += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDecoder;
    use crate::symbol::SymbolKind;
    use crate::usb::Pid;

    fn run(whacker: &mut Whacker, symbols: &[Symbol], now: &mut u64) -> Vec<u8> {
        let mut output = Vec::new();
        for symbol in symbols {
            loop {
                let step = whacker.step(Some(symbol), *now, true);
                *now += 1;
                output.extend(step.output);
                if step.consumed {
                    break;
                }
            }
        }
        while !whacker.is_drained() {
            output.extend(whacker.step(None, *now, true).output);
            *now += 1;
        }
        output
    }

    #[test]
    fn session_with_one_packet() {
        let mut whacker = Whacker::default();
        let mut now = 0;
        whacker.set_config(Config::default().with_enable(true));
        let mut output = run(&mut whacker, &Symbol::packet(50, &[0xD2]), &mut now);
        whacker.set_config(Config::default());
        output.extend(run(&mut whacker, &[], &mut now));

        let frames = FrameDecoder::decode(0, &output).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].flags.first());
        assert_eq!(frames[1].payload, [0xD2]);
        assert_eq!(frames[1].timestamp, 50);
        assert!(frames[2].flags.last());

        let stats = whacker.stats();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.bytes, output.len() as u64);
    }

    #[test]
    fn disabled_pipeline_is_silent() {
        let mut whacker = Whacker::default();
        let mut now = 0;
        let output = run(&mut whacker, &Symbol::packet(5, &[1, 2, 3]), &mut now);
        assert!(output.is_empty());
        assert_eq!(whacker.stats(), Statistics::default());
    }

    #[test]
    fn held_transaction_does_not_block_a_large_packet() {
        let mut whacker = Whacker::default();
        let mut now = 0;
        whacker.set_config(Config::default().with_enable(true).with_filter_nak(true));
        let mut symbols = Symbol::packet(10, &crate::usb::token_packet(Pid::OUT, 1, 1));
        symbols.extend(Symbol::packet(100, &crate::usb::data_packet(Pid::DATA0, &[0x11; 1024])));
        symbols.extend(Symbol::packet(2_000, &crate::usb::data_packet(Pid::DATA1, &[0x22; 1024])));
        let output = run(&mut whacker, &symbols, &mut now);

        let frames = FrameDecoder::decode(0, &output).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|frame| !frame.discarded));
        assert_eq!(whacker.stats().discarded, 0);
    }

    #[test]
    fn counts_flags() {
        let mut whacker = Whacker::default();
        let mut now = 0;
        whacker.set_config(Config::default().with_enable(true).with_filter_sof(true));
        let mut symbols = Symbol::packet(10, &[0xA5, 0x00, 0x10]);
        symbols.push(Symbol::new(SymbolKind::StartOfPacket, 20));
        symbols.push(Symbol::data(0xD2, 21));
        symbols.push(Symbol::new(SymbolKind::LineError, 22));
        run(&mut whacker, &symbols, &mut now);

        let stats = whacker.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.frames, 2);
    }
}
