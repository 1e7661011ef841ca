//! Stages that mark packets for discard.

pub mod lookaside;
pub mod nak;
pub mod sof;

pub use lookaside::{CrcCheck, LookAside, LookAsideSet, MatchAction, PatternMatch};
pub use nak::FilterNak;
pub use sof::filter_sof;
