//! Capture side of the pipeline.
//!
//! Groups receiver symbols into packets, stores their bytes in the ring and
//! describes each one with a [`PacketDescriptor`]. No header is written
//! here: the consumer builds it once the descriptor reaches the front of
//! the queue. The producer only keeps `MAX_HEADER_SIZE` bytes free ahead of
//! each packet so admission is decided the same way whatever the header
//! turns out to be.

use tracing::{debug, trace};

use crate::descriptor::{COUNT_LIMIT, Flags, MAX_PACKET_SIZE, PacketDescriptor};
use crate::filter::{LookAside, LookAsideSet};
use crate::frame::MAX_HEADER_SIZE;
use crate::ring::WritePort;
use crate::symbol::{Symbol, SymbolKind};
use crate::usb::Pid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    /// Between packets.
    Idle,
    /// Receiving packet data.
    Data,
    /// Packet closed, waiting for look-aside classifiers.
    WaitDone,
    /// Descriptor ready, waiting for the next stage to take it.
    Send,
}

pub struct Producer {
    state: ProducerState,
    produce_write: usize,
    produce_header: usize,
    enable_last: bool,
    stuff_flags: Flags,
    stuff_timestamp: u64,
    packet: PacketDescriptor,
    lookaside: LookAsideSet,
}

impl Default for Producer {
    fn default() -> Self {
        Producer::new()
    }
}

impl Producer {
    pub fn new() -> Producer {
        Producer {
            state: ProducerState::Idle,
            produce_write: 0,
            produce_header: MAX_HEADER_SIZE,
            enable_last: false,
            stuff_flags: Flags::default(),
            stuff_timestamp: 0,
            packet: PacketDescriptor::default(),
            lookaside: LookAsideSet::default(),
        }
    }

    pub fn add_lookaside(&mut self, filter: Box<dyn LookAside>) {
        self.lookaside.push(filter);
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn produce_write(&self) -> usize {
        self.produce_write
    }

    pub fn produce_header(&self) -> usize {
        self.produce_header
    }

    /// Whether a session boundary is still waiting to be sent.
    pub fn stuff_pending(&self) -> bool {
        self.stuff_flags.first() || self.stuff_flags.last()
    }

    /// True when nothing is in flight and the last enable edge was handled.
    pub fn is_idle(&self, enable: bool) -> bool {
        self.state == ProducerState::Idle && !self.stuff_pending() && self.enable_last == enable
    }

    /// The finished descriptor, if one is waiting to be taken.
    pub fn pending(&self) -> Option<&PacketDescriptor> {
        match self.state {
            ProducerState::Send => Some(&self.packet),
            _ => None,
        }
    }

    /// The next stage has taken the pending descriptor.
    pub fn complete_send(&mut self) -> Option<PacketDescriptor> {
        if self.state != ProducerState::Send {
            return None;
        }
        // Reserve space for the worst case header ahead of the next packet.
        // Nothing was stored if the packet was empty, so there is nothing to
        // reserve past.
        if self.produce_write != self.produce_header {
            self.produce_header = self.produce_write + MAX_HEADER_SIZE;
        }
        self.state = ProducerState::Idle;
        Some(self.packet)
    }

    /// Advance one tick.
    ///
    /// `input` is the symbol currently offered by the receiver and `now` the
    /// current tick. Returns whether `input` was accepted; an unaccepted
    /// symbol must be offered again.
    pub fn step(
        &mut self,
        input: Option<&Symbol>,
        now: u64,
        enable: bool,
        watermark: usize,
        ring: &mut WritePort<'_>,
    ) -> bool {
        self.track_enable(enable, now);
        self.produce_header = ring.wrap(self.produce_header);
        let has_space = ring.has_space(self.produce_write, watermark);

        match self.state {
            ProducerState::Idle => self.idle(input, enable, has_space),
            ProducerState::Data => match input {
                Some(symbol) if has_space => {
                    self.ingest(symbol, ring);
                    true
                }
                _ => false,
            },
            ProducerState::WaitDone => {
                self.lookaside.tick();
                self.finish();
                false
            }
            ProducerState::Send => false,
        }
    }

    fn track_enable(&mut self, enable: bool, now: u64) {
        if enable == self.enable_last {
            return;
        }
        if !self.stuff_pending() {
            self.stuff_timestamp = now;
        }
        if enable {
            debug!(timestamp = now, "capture enabled");
            self.stuff_flags.set_first(true);
        } else {
            debug!(timestamp = now, "capture disabled");
            self.stuff_flags.set_last(true);
        }
        self.enable_last = enable;
    }

    fn idle(&mut self, input: Option<&Symbol>, enable: bool, has_space: bool) -> bool {
        // At start or end of capture, send a packet giving the exact time.
        if self.stuff_pending() {
            if has_space {
                self.produce_write = self.produce_header;
                self.packet =
                    PacketDescriptor::stuff(self.stuff_timestamp, self.produce_header, self.stuff_flags);
                self.stuff_flags = Flags::default();
                self.state = ProducerState::Send;
            }
            return false;
        }

        let Some(symbol) = input else {
            return false;
        };

        // If not enabled, we just dump received symbols.
        if !enable {
            return true;
        }

        if !has_space {
            return false;
        }

        match symbol.kind {
            SymbolKind::StartOfPacket => self.begin(symbol.timestamp, Flags::default()),
            kind => trace!(?kind, "ignoring symbol outside packet"),
        }
        true
    }

    fn begin(&mut self, timestamp: u64, flags: Flags) {
        self.produce_write = self.produce_header;
        self.packet = PacketDescriptor {
            timestamp,
            flags,
            start: self.produce_header,
            ..Default::default()
        };
        self.lookaside.reset();
        self.state = ProducerState::Data;
    }

    fn ingest(&mut self, symbol: &Symbol, ring: &mut WritePort<'_>) {
        match symbol.kind {
            SymbolKind::Data(byte) => {
                if self.packet.count == 0 {
                    let (pid, valid) = Pid::decode(byte);
                    self.packet.pid = pid;
                    self.packet.pid_valid = valid;
                }
                if self.packet.count < MAX_PACKET_SIZE {
                    ring.write(self.produce_write, byte);
                    self.produce_write = ring.wrap(self.produce_write + 1);
                    self.lookaside.feed(byte);
                } else if self.packet.count == MAX_PACKET_SIZE {
                    debug!(timestamp = self.packet.timestamp, "packet truncated");
                }
                if self.packet.count < COUNT_LIMIT {
                    self.packet.count += 1;
                }
            }
            SymbolKind::StartOfPacket => {
                // The previous packet never ended; data was lost.
                debug!(
                    abandoned = self.packet.timestamp,
                    timestamp = symbol.timestamp,
                    "start-of-packet during packet"
                );
                let mut flags = Flags::default();
                flags.set_ovf(true);
                self.begin(symbol.timestamp, flags);
            }
            SymbolKind::EndOfPacket => self.close(),
            SymbolKind::LineError => {
                self.packet.flags.set_err(true);
                self.close();
            }
            SymbolKind::RxOverflow => {
                self.packet.flags.set_ovf(true);
                self.close();
            }
        }
    }

    fn close(&mut self) {
        self.state = ProducerState::WaitDone;
        self.finish();
    }

    fn finish(&mut self) {
        if !self.lookaside.is_done() {
            return;
        }
        if self.lookaside.is_reject() {
            self.packet.discard = true;
        }
        trace!(
            timestamp = self.packet.timestamp,
            count = self.packet.count,
            start = self.packet.start,
            "packet captured"
        );
        self.state = ProducerState::Send;
    }
}
