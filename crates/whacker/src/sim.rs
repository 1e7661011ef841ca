//! Deterministic replay of a symbol stream through a pipeline.
//!
//! The simulator owns the clock. Symbols are queued up front and each is
//! stamped with the tick at which the receiver first presents it, so output
//! depends only on the queued symbols, idle gaps and sink readiness.

use std::collections::VecDeque;

use anyhow::bail;

use crate::Result;
use crate::config::{Config, PipelineSettings};
use crate::filter::LookAside;
use crate::symbol::{Symbol, SymbolKind};
use crate::whacker::{Statistics, Whacker};

/// Upper bound on ticks spent in [`Simulator::drain`].
const DRAIN_LIMIT: u64 = 1 << 24;

type SinkReady = Box<dyn FnMut(u64) -> bool + Send>;

pub struct Simulator {
    whacker: Whacker,
    now: u64,
    pending: VecDeque<SymbolKind>,
    presented: Option<Symbol>,
    sink: Option<SinkReady>,
    output: Vec<u8>,
}

impl Simulator {
    pub fn new(settings: &PipelineSettings) -> Simulator {
        Simulator {
            whacker: Whacker::new(settings),
            now: 0,
            pending: VecDeque::new(),
            presented: None,
            sink: None,
            output: Vec::new(),
        }
    }

    /// Decide sink readiness per tick instead of always accepting.
    pub fn with_sink(mut self, ready: impl FnMut(u64) -> bool + Send + 'static) -> Simulator {
        self.sink = Some(Box::new(ready));
        self
    }

    pub fn add_lookaside(&mut self, filter: Box<dyn LookAside>) {
        self.whacker.add_lookaside(filter);
    }

    pub fn set_config(&mut self, config: Config) {
        self.whacker.set_config(config);
    }

    pub fn config(&self) -> Config {
        self.whacker.config()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn whacker(&self) -> &Whacker {
        &self.whacker
    }

    pub fn stats(&self) -> Statistics {
        self.whacker.stats()
    }

    /// Queue one symbol.
    pub fn send(&mut self, kind: SymbolKind) {
        self.pending.push_back(kind);
    }

    /// Queue a complete packet.
    pub fn packet(&mut self, bytes: &[u8]) {
        self.send(SymbolKind::StartOfPacket);
        for byte in bytes {
            self.send(SymbolKind::Data(*byte));
        }
        self.send(SymbolKind::EndOfPacket);
    }

    /// Advance one tick.
    pub fn tick(&mut self) {
        if self.presented.is_none() {
            self.presented = self
                .pending
                .pop_front()
                .map(|kind| Symbol::new(kind, self.now));
        }
        let sink_ready = match self.sink.as_mut() {
            Some(ready) => ready(self.now),
            None => true,
        };
        let step = self
            .whacker
            .step(self.presented.as_ref(), self.now, sink_ready);
        if step.consumed {
            self.presented = None;
        }
        self.output.extend(step.output);
        self.now += 1;
    }

    /// Advance `ticks` ticks.
    pub fn idle(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Advance until the clock reaches `tick`.
    pub fn idle_until(&mut self, tick: u64) {
        while self.now < tick {
            self.tick();
        }
    }

    /// Run until every queued symbol has been accepted.
    pub fn flush(&mut self) -> Result<()> {
        let deadline = self.now + DRAIN_LIMIT;
        while self.presented.is_some() || !self.pending.is_empty() {
            if self.now >= deadline {
                bail!("Receiver symbols not accepted after {DRAIN_LIMIT} ticks");
            }
            self.tick();
        }
        Ok(())
    }

    /// Run until every queued symbol has gone through the pipeline.
    pub fn drain(&mut self) -> Result<()> {
        self.flush()?;
        let deadline = self.now + DRAIN_LIMIT;
        while !self.whacker.is_drained() {
            if self.now >= deadline {
                bail!("Pipeline not drained after {DRAIN_LIMIT} ticks");
            }
            self.tick();
        }
        Ok(())
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}
