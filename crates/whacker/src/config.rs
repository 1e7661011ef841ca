//! Pipeline configuration: the control register and structural settings.

use anyhow::bail;

use crate::Result;
use crate::descriptor::MAX_PACKET_SIZE;
use crate::frame::MAX_HEADER_SIZE;

/// Default ring buffer depth, in bytes.
pub const DEFAULT_DEPTH: usize = 2048;

/// Default number of descriptors held between the filters and the consumer.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Timeout, in ticks, after which a partially filled host burst is sent.
pub const FLUSH_TIMEOUT: u64 = 10_000_000;

/// Idle ticks before a filler byte is emitted after an odd byte count.
pub const FILLER_TIMEOUT: u64 = FLUSH_TIMEOUT / 2;

bitfield! {
    /// The capture control register.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Config(u8);
    impl Debug;
    pub bool, enable, set_enable: 0;
    pub bool, debug_discard, set_debug_discard: 1;
    pub bool, filter_nak, set_filter_nak: 2;
    pub bool, filter_sof, set_filter_sof: 3;
}

impl Config {
    pub fn from_bits(bits: u8) -> Config {
        Config(bits & 0x0F)
    }

    pub fn bits(&self) -> u8 {
        self.0 & 0x0F
    }

    pub fn with_enable(mut self, on: bool) -> Config {
        self.set_enable(on);
        self
    }

    pub fn with_debug_discard(mut self, on: bool) -> Config {
        self.set_debug_discard(on);
        self
    }

    pub fn with_filter_nak(mut self, on: bool) -> Config {
        self.set_filter_nak(on);
        self
    }

    pub fn with_filter_sof(mut self, on: bool) -> Config {
        self.set_filter_sof(on);
        self
    }
}

/// Structural parameters of a pipeline, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub(crate) depth: usize,
    pub(crate) queue_depth: usize,
    pub(crate) filler_timeout: u64,
    pub(crate) config: Config,
}

impl PipelineSettings {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn filler_timeout(&self) -> u64 {
        self.filler_timeout
    }

    /// The control register value the pipeline starts with.
    pub fn config(&self) -> Config {
        self.config
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            depth: DEFAULT_DEPTH,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            filler_timeout: FILLER_TIMEOUT,
            config: Config::default(),
        }
    }
}

#[derive(Default)]
pub struct PipelineSettingsBuilder {
    depth: Option<usize>,
    queue_depth: Option<usize>,
    filler_timeout: Option<u64>,
    config: Option<Config>,
}

impl PipelineSettingsBuilder {
    pub fn new() -> Self {
        PipelineSettingsBuilder::default()
    }

    /// Set the ring buffer depth. Must be a power of two large enough to
    /// hold a maximum size packet with its header reservations.
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Set the number of descriptors the metadata queue can hold.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set the idle time, in ticks, before a filler byte is sent.
    pub fn filler_timeout(mut self, ticks: u64) -> Self {
        self.filler_timeout = Some(ticks);
        self
    }

    /// Set the initial control register value.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<PipelineSettings> {
        let depth = self.depth.unwrap_or(DEFAULT_DEPTH);
        let queue_depth = self.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH);
        let filler_timeout = self.filler_timeout.unwrap_or(FILLER_TIMEOUT);
        let config = self.config.unwrap_or_default();

        if !depth.is_power_of_two() {
            bail!("Ring buffer depth {depth} is not a power of two");
        }
        // One full packet, the reservation ahead of it and the admission margin.
        let minimum = usize::from(MAX_PACKET_SIZE) + 2 * MAX_HEADER_SIZE + 2;
        if depth < minimum {
            bail!("Ring buffer depth {depth} is too small, need at least {minimum}");
        }
        if queue_depth == 0 {
            bail!("Metadata queue depth must be at least 1");
        }
        if filler_timeout == 0 {
            bail!("Filler timeout must be at least one tick");
        }

        Ok(PipelineSettings {
            depth,
            queue_depth,
            filler_timeout,
            config,
        })
    }
}
