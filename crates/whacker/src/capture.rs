//! Running a capture on a worker thread, and metadata describing it.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Error};
use merge::Merge;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::{Config, PipelineSettings};
use crate::descriptor::MAX_PACKET_SIZE;
use crate::filter::LookAside;
use crate::frame::{Frame, FrameDecoder};
use crate::symbol::{Symbol, SymbolKind};
use crate::util::{join_worker, ticks_to_ns};
use crate::whacker::{Statistics, Whacker};

/// Size of the output buffers passed from the worker to the stream.
pub const READ_LEN: usize = 0x4000;

/// Output buffers in flight before the worker sees a stalled sink.
const NUM_BUFFERS: usize = 4;

/// Metadata about the capture.
#[derive(Clone, Debug, Default, Merge)]
pub struct CaptureMetadata {
    // Fields corresponding to PCapNG section header.
    pub application: Option<String>,
    pub os: Option<String>,
    pub hardware: Option<String>,
    pub comment: Option<String>,

    // Fields corresponding to PcapNG interface description.
    pub iface_desc: Option<String>,
    pub iface_snaplen: Option<NonZeroU32>,

    // Fields corresponding to PcapNG interface statistics.
    pub start_time: Option<Duration>,
    pub end_time: Option<Duration>,
    pub dropped: Option<u64>,
}

/// State shared between a [`CaptureStream`] and its worker.
struct Control {
    config: AtomicU8,
    stop: AtomicBool,
}

/// A capture, configured but not yet started.
pub struct Capture {
    settings: PipelineSettings,
    lookasides: Vec<Box<dyn LookAside>>,
    metadata: CaptureMetadata,
}

impl Capture {
    pub fn new(settings: PipelineSettings) -> Capture {
        let metadata = CaptureMetadata {
            application: Some(format!("whacker {}", env!("CARGO_PKG_VERSION"))),
            os: Some(std::env::consts::OS.to_string()),
            iface_desc: Some(String::from("USB capture pipeline")),
            iface_snaplen: NonZeroU32::new(u32::from(MAX_PACKET_SIZE)),
            ..Default::default()
        };
        Capture {
            settings,
            lookasides: Vec::new(),
            metadata,
        }
    }

    pub fn add_lookaside(&mut self, filter: Box<dyn LookAside>) {
        self.lookasides.push(filter);
    }

    pub fn metadata(&self) -> &CaptureMetadata {
        &self.metadata
    }

    /// Add caller supplied metadata. Fields already set by the caller take
    /// precedence over the defaults.
    pub fn set_metadata(&mut self, mut metadata: CaptureMetadata) {
        metadata.merge(self.metadata.clone());
        self.metadata = metadata;
    }

    /// Start capturing `symbols` on a worker thread.
    ///
    /// The capture enable bit is set regardless of the configured value.
    /// The capture ends when the symbols run out or the stream is stopped.
    pub fn start<S>(self, symbols: S) -> Result<CaptureStream>
    where
        S: IntoIterator<Item = Symbol>,
        S::IntoIter: Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::sync_channel(NUM_BUFFERS);
        let (reuse_tx, reuse_rx) = mpsc::channel();
        let config = self.settings.config().with_enable(true);
        let control = Arc::new(Control {
            config: AtomicU8::new(config.bits()),
            stop: AtomicBool::new(false),
        });

        let mut whacker = Whacker::new(&self.settings);
        for filter in self.lookasides {
            whacker.add_lookaside(filter);
        }
        let worker = Worker {
            whacker,
            symbols: symbols.into_iter(),
            control: control.clone(),
            data_tx,
            reuse_rx,
        };
        let handle = thread::Builder::new()
            .name(String::from("whacker-capture"))
            .spawn(move || worker.run())
            .context("Failed to spawn capture worker thread")?;
        info!(config = ?config, "capture started");

        Ok(CaptureStream {
            data_rx,
            reuse_tx,
            decoder: FrameDecoder::new(),
            control,
            worker: Some(handle),
            metadata: self.metadata,
            first: None,
            last: None,
        })
    }
}

struct Worker<I> {
    whacker: Whacker,
    symbols: I,
    control: Arc<Control>,
    data_tx: SyncSender<Vec<u8>>,
    reuse_rx: Receiver<Vec<u8>>,
}

impl<I: Iterator<Item = Symbol>> Worker<I> {
    fn run(mut self) -> Result<Statistics> {
        let mut presented: Option<Symbol> = None;
        let mut exhausted = false;
        let mut batch = self.next_buffer();

        // The first tick only marks the start of the session.
        let config = self.config();
        self.whacker.set_config(config);
        self.whacker.step(None, 0, true);
        let mut now = 1;

        loop {
            let stopping = exhausted || self.control.stop.load(Ordering::Acquire);
            let mut config = self.config();
            if stopping {
                config.set_enable(false);
            }
            self.whacker.set_config(config);

            if presented.is_none() {
                if !stopping {
                    presented = self.symbols.next();
                    match presented {
                        Some(symbol) => now = now.max(symbol.timestamp),
                        None => {
                            debug!(now, "symbol source exhausted");
                            exhausted = true;
                        }
                    }
                } else if self.whacker.in_packet() {
                    // The rest of the packet will never arrive.
                    presented = Some(Symbol::new(SymbolKind::RxOverflow, now));
                }
            }

            let step = self
                .whacker
                .step(presented.as_ref(), now, batch.len() < READ_LEN);
            if step.consumed {
                presented = None;
            }
            batch.extend(step.output);
            now += 1;

            if stopping && self.whacker.is_drained() {
                if !batch.is_empty() {
                    // The stream may already be gone; nothing more to do then.
                    let _ = self.data_tx.send(batch);
                }
                let stats = self.whacker.stats();
                info!(
                    packets = stats.packets,
                    frames = stats.frames,
                    skipped = stats.skipped,
                    "capture finished"
                );
                return Ok(stats);
            }

            let stalled = !step.consumed && step.output.is_none();
            let flush = batch.len() >= READ_LEN
                || (stalled && !batch.is_empty() && self.whacker.is_drained());
            if !flush {
                continue;
            }
            match self.data_tx.try_send(batch) {
                Ok(()) => batch = self.next_buffer(),
                Err(TrySendError::Full(full)) if stalled => {
                    // Nothing else can move until the host takes a buffer.
                    if self.data_tx.send(full).is_err() {
                        return Ok(self.closed());
                    }
                    batch = self.next_buffer();
                }
                Err(TrySendError::Full(full)) => batch = full,
                Err(TrySendError::Disconnected(_)) => return Ok(self.closed()),
            }
        }
    }

    fn config(&self) -> Config {
        Config::from_bits(self.control.config.load(Ordering::Relaxed))
    }

    fn next_buffer(&self) -> Vec<u8> {
        match self.reuse_rx.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                buffer
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Vec::with_capacity(READ_LEN),
        }
    }

    fn closed(&self) -> Statistics {
        warn!("capture stream closed before the capture finished");
        self.whacker.stats()
    }
}

/// Result of [`CaptureStream::poll_next`].
pub enum FramePoll {
    Frame(Result<Frame>),
    Timeout,
    Ended,
}

enum WaitResult {
    Received,
    Timeout,
    Ended,
}

/// Converts the worker's output bytes to timestamped frames.
pub struct CaptureStream {
    data_rx: Receiver<Vec<u8>>,
    reuse_tx: Sender<Vec<u8>>,
    decoder: FrameDecoder,
    control: Arc<Control>,
    worker: Option<JoinHandle<Result<Statistics>>>,
    metadata: CaptureMetadata,
    first: Option<u64>,
    last: Option<u64>,
}

impl CaptureStream {
    pub fn config(&self) -> Config {
        Config::from_bits(self.control.config.load(Ordering::Relaxed))
    }

    /// Change the control register while capturing.
    pub fn set_config(&self, config: Config) {
        self.control.config.store(config.bits(), Ordering::Relaxed);
    }

    /// Ask the worker to end the session. Frames keep arriving until the
    /// pipeline has drained and the session end has been sent.
    pub fn request_stop(&self) {
        self.control.stop.store(true, Ordering::Release);
    }

    /// Stop the capture and wait for the worker. Frames not yet read are
    /// dropped.
    pub fn stop(mut self) -> Result<CaptureMetadata> {
        self.request_stop();
        while let Some(result) = self.next() {
            if let Err(err) = result {
                warn!("discarding undecodable output: {err}");
            }
        }
        self.finish()
    }

    /// Wait for the worker after the stream has ended, and describe the
    /// session.
    pub fn finish(mut self) -> Result<CaptureMetadata> {
        let stats = match self.worker.take() {
            Some(handle) => join_worker(handle)?,
            None => Statistics::default(),
        };
        let mut metadata = CaptureMetadata {
            start_time: self.first.map(|t| Duration::from_nanos(ticks_to_ns(t))),
            end_time: self.last.map(|t| Duration::from_nanos(ticks_to_ns(t))),
            dropped: Some(stats.skipped),
            ..Default::default()
        };
        metadata.merge(self.metadata.clone());
        Ok(metadata)
    }

    pub fn poll_next(&mut self, timeout: Duration) -> FramePoll {
        loop {
            match self.next_buffered_frame() {
                Some(result) => return FramePoll::Frame(result),
                None => match self.wait_for_next_buffer(Some(timeout)) {
                    WaitResult::Received => continue,
                    WaitResult::Timeout => return FramePoll::Timeout,
                    WaitResult::Ended => return FramePoll::Ended,
                },
            }
        }
    }

    fn wait_for_next_buffer(&mut self, timeout: Option<Duration>) -> WaitResult {
        let recv_result = match timeout {
            Some(timeout) => self.data_rx.recv_timeout(timeout),
            None => self
                .data_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match recv_result {
            Ok(buffer) => {
                self.decoder.push(&buffer);
                // Buffer can now be reused.
                let _ = self.reuse_tx.send(buffer);
                WaitResult::Received
            }
            Err(RecvTimeoutError::Timeout) => WaitResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => WaitResult::Ended,
        }
    }

    fn next_buffered_frame(&mut self) -> Option<Result<Frame>> {
        let result = self.decoder.next_frame()?;
        Some(match result {
            Ok(frame) => {
                self.first.get_or_insert(frame.timestamp);
                self.last = Some(frame.timestamp);
                Ok(frame)
            }
            Err(err) => Err(Error::from(err)),
        })
    }
}

impl Iterator for CaptureStream {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Result<Frame>> {
        loop {
            // Do we have another frame already decoded?
            match self.next_buffered_frame() {
                Some(result) => return Some(result),
                // No; wait for more data from the capture thread.
                None => match self.wait_for_next_buffer(None) {
                    WaitResult::Received => continue,
                    WaitResult::Timeout => continue,
                    WaitResult::Ended => return None,
                },
            }
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.request_stop();
        // The worker may be blocked handing over a buffer.
        while self.data_rx.recv().is_ok() {}
        if let Err(err) = join_worker(handle) {
            error!("capture worker failed: {err:#}");
        }
    }
}
