#[macro_use]
extern crate bitfield;

pub mod capture;
pub mod config;
pub mod consumer;
pub mod descriptor;
pub mod filter;
pub mod frame;
pub mod producer;
pub mod queue;
pub mod ring;
pub mod sim;
pub mod symbol;
pub mod usb;
pub mod util;
pub mod whacker;

use anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::capture::{Capture, CaptureMetadata, CaptureStream, FramePoll};
pub use crate::config::{Config, PipelineSettings, PipelineSettingsBuilder};
pub use crate::descriptor::{Flags, MAX_PACKET_SIZE, PacketDescriptor};
pub use crate::filter::{CrcCheck, LookAside, MatchAction, PatternMatch};
pub use crate::frame::{DecodeError, Frame, FrameDecoder};
pub use crate::sim::Simulator;
pub use crate::symbol::{Symbol, SymbolKind};
pub use crate::usb::{Pid, validate_packet};
pub use crate::whacker::{Statistics, Step, Whacker};
