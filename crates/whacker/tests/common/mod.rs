#![allow(dead_code)]

use whacker::frame::Header;
use whacker::{
    Config, Flags, Frame, FrameDecoder, MAX_PACKET_SIZE, PacketDescriptor, PipelineSettings,
    Symbol, Whacker,
};

/// Ticks allowed for the pipeline to drain before a test gives up.
const DRAIN_LIMIT: u64 = 1 << 22;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Drives a pipeline with symbols carrying their own timestamps.
///
/// The clock starts at zero and jumps forward to each symbol's timestamp,
/// so packet timestamps are known in advance.
pub struct Bench {
    pub whacker: Whacker,
    pub now: u64,
    output: Vec<u8>,
    sink: Box<dyn FnMut() -> bool>,
}

impl Bench {
    /// A bench that has already started a session at tick zero.
    pub fn start(config: Config) -> Bench {
        Bench::start_with(&PipelineSettings::default(), config)
    }

    pub fn start_with(settings: &PipelineSettings, config: Config) -> Bench {
        init_tracing();
        let mut whacker = Whacker::new(settings);
        whacker.set_config(config.with_enable(true));
        let mut bench = Bench {
            whacker,
            now: 0,
            output: Vec::new(),
            sink: Box::new(|| true),
        };
        bench.step(None);
        bench
    }

    pub fn with_sink(mut self, ready: impl FnMut() -> bool + 'static) -> Bench {
        self.sink = Box::new(ready);
        self
    }

    pub fn step(&mut self, input: Option<&Symbol>) -> bool {
        let ready = (self.sink)();
        let step = self.whacker.step(input, self.now, ready);
        self.output.extend(step.output);
        self.now += 1;
        step.consumed
    }

    pub fn offer(&mut self, symbols: &[Symbol]) {
        for symbol in symbols {
            self.now = self.now.max(symbol.timestamp);
            let deadline = self.now + DRAIN_LIMIT;
            while !self.step(Some(symbol)) {
                assert!(self.now < deadline, "symbol never accepted");
            }
        }
    }

    pub fn packet(&mut self, timestamp: u64, bytes: &[u8]) {
        self.offer(&Symbol::packet(timestamp, bytes));
    }

    pub fn drain(&mut self) {
        let deadline = self.now + DRAIN_LIMIT;
        while !self.whacker.is_drained() {
            assert!(self.now < deadline, "pipeline never drained");
            self.step(None);
        }
    }

    pub fn idle(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step(None);
        }
    }

    /// Drain, end the session and drain again. Returns the tick at which
    /// the session ended.
    pub fn stop(&mut self) -> u64 {
        self.drain();
        let end = self.now;
        let config = self.whacker.config().with_enable(false);
        self.whacker.set_config(config);
        self.drain();
        end
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn frames(&self) -> Vec<Frame> {
        FrameDecoder::decode(0, &self.output).unwrap()
    }
}

/// Builds the byte stream a pipeline must produce, frame by frame.
#[derive(Default)]
pub struct Expected {
    bytes: Vec<u8>,
    previous: Option<u64>,
}

impl Expected {
    pub fn session() -> Expected {
        let mut expected = Expected::default();
        let mut flags = Flags::default();
        flags.set_first(true);
        expected.frame(0, flags, &[], false);
        expected
    }

    pub fn frame(&mut self, timestamp: u64, flags: Flags, payload: &[u8], discarded: bool) {
        let desc = PacketDescriptor {
            timestamp,
            flags,
            count: payload.len() as u16,
            ..Default::default()
        };
        let delta = self.previous.map_or(0, |previous| timestamp - previous);
        self.previous = Some(timestamp);
        self.bytes
            .extend_from_slice(Header::encode(&desc, delta, discarded).as_bytes());
        let len = payload.len().min(usize::from(MAX_PACKET_SIZE));
        self.bytes.extend_from_slice(&payload[..len]);
    }

    pub fn packet(&mut self, timestamp: u64, payload: &[u8]) {
        self.frame(timestamp, Flags::default(), payload, false);
    }

    pub fn end(mut self, timestamp: u64) -> Vec<u8> {
        let mut flags = Flags::default();
        flags.set_last(true);
        self.frame(timestamp, flags, &[], false);
        self.bytes
    }
}
