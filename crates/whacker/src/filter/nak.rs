//! Filter for NAKed transactions.
//!
//! Hosts retry IN, PING and OUT transactions for as long as the device
//! answers NAK. The filter holds the token (and the DATA packet of an OUT)
//! until the handshake is seen, then releases the whole transaction with
//! `discard` set if that handshake was a NAK.
//!
//! Only PIDs are inspected. A NAK answering something a real host would
//! never send it for, such as a SETUP, is forwarded untouched, and split
//! transactions are never filtered.

use tracing::{debug, trace, warn};

use crate::descriptor::PacketDescriptor;
use crate::queue::BoundedQueue;
use crate::usb::Pid;

/// Token, DATA packet and handshake.
const HOLD_DEPTH: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NakState {
    /// Waiting for the first packet of a transaction.
    Default,
    /// Seen a SPLIT token.
    Split,
    /// Seen an OUT token, expecting DATA0 or DATA1.
    Out,
    /// Expecting the handshake that decides the transaction.
    Handshake,
    /// Releasing held packets unchanged.
    Forward,
    /// Releasing held packets marked for discard.
    Discard,
}

pub struct FilterNak {
    state: NakState,
    held: BoundedQueue<PacketDescriptor>,
}

impl Default for FilterNak {
    fn default() -> Self {
        FilterNak::new()
    }
}

impl FilterNak {
    pub fn new() -> FilterNak {
        FilterNak {
            state: NakState::Default,
            held: BoundedQueue::new(HOLD_DEPTH),
        }
    }

    pub fn state(&self) -> NakState {
        self.state
    }

    /// Number of packets currently held back.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Whether packets are held waiting for a later packet to decide them.
    pub fn is_holding(&self) -> bool {
        !self.held.is_empty()
            && matches!(self.state, NakState::Split | NakState::Out | NakState::Handshake)
    }

    /// Forward the held transaction unchanged without waiting for its
    /// handshake. Used when the ring cannot take the packet that would
    /// decide it.
    pub fn release(&mut self) {
        if self.is_holding() {
            debug!(held = self.held.len(), from = ?self.state, "releasing undecided transaction");
            self.state = NakState::Forward;
        }
    }

    /// Offer the next packet. Returns whether it was accepted; a refused
    /// packet must be offered again once the held packets have drained.
    pub fn offer(&mut self, desc: &PacketDescriptor, enable: bool) -> bool {
        use NakState::*;

        // With the filter disabled no PID matches, so every packet goes
        // straight from Default to Forward.
        let pid = if enable { desc.pid() } else { None };

        let (accept, next) = match self.state {
            Default => {
                let next = match pid {
                    Some(Pid::SPLIT) => Split,
                    Some(Pid::IN | Pid::PING) => Handshake,
                    Some(Pid::OUT) => Out,
                    _ => Forward,
                };
                (true, next)
            }
            // Whatever follows a SPLIT is passed on; another SPLIT starts over.
            Split => (pid != Some(Pid::SPLIT), Forward),
            Out => match pid {
                Some(Pid::DATA0 | Pid::DATA1) => (true, Handshake),
                _ => (false, Forward),
            },
            Handshake => match pid {
                Some(Pid::NAK) => (true, Discard),
                _ => (false, Forward),
            },
            Forward | Discard => (false, self.state),
        };

        if accept && self.held.push(*desc).is_err() {
            // Transitions above never hold more than a token, a DATA
            // packet and a handshake.
            warn!(state = ?self.state, "NAK filter hold queue overflow");
            return false;
        }

        if next == Discard {
            debug!(held = self.held.len(), "discarding NAKed transaction");
        }
        trace!(?pid, from = ?self.state, to = ?next, accept, "NAK filter");
        self.state = next;
        accept
    }

    /// Take the next released packet, if the filter is releasing.
    pub fn take(&mut self) -> Option<PacketDescriptor> {
        match self.state {
            NakState::Forward | NakState::Discard => match self.held.pop() {
                Some(mut desc) => {
                    if self.state == NakState::Discard {
                        desc.discard = true;
                    }
                    Some(desc)
                }
                None => {
                    self.state = NakState::Default;
                    None
                }
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pid: Pid, timestamp: u64) -> PacketDescriptor {
        PacketDescriptor {
            timestamp,
            pid: pid.into(),
            pid_valid: true,
            count: 1,
            ..Default::default()
        }
    }

    /// Push a packet sequence through the filter, returning what comes out.
    fn run(filter: &mut FilterNak, pids: &[Pid], enable: bool) -> Vec<(Pid, bool)> {
        let mut output = Vec::new();
        let drain = |filter: &mut FilterNak, output: &mut Vec<(Pid, bool)>| {
            while let Some(desc) = filter.take() {
                output.push((desc.pid().unwrap(), desc.discard));
            }
        };
        for (index, pid) in pids.iter().enumerate() {
            let desc = packet(*pid, index as u64);
            while !filter.offer(&desc, enable) {
                drain(filter, &mut output);
            }
        }
        drain(filter, &mut output);
        output
    }

    #[test]
    fn out_transaction_naked() {
        let mut filter = FilterNak::new();
        let output = run(
            &mut filter,
            &[Pid::OUT, Pid::DATA0, Pid::NAK, Pid::OUT, Pid::DATA0, Pid::ACK],
            true,
        );
        assert_eq!(
            output,
            [
                (Pid::OUT, true),
                (Pid::DATA0, true),
                (Pid::NAK, true),
                (Pid::OUT, false),
                (Pid::DATA0, false),
                (Pid::ACK, false),
            ]
        );
        assert!(filter.is_empty());
        assert_eq!(filter.state(), NakState::Default);
    }

    #[test]
    fn in_and_ping_naked() {
        let mut filter = FilterNak::new();
        let output = run(
            &mut filter,
            &[Pid::IN, Pid::NAK, Pid::PING, Pid::NAK, Pid::IN, Pid::DATA1, Pid::ACK],
            true,
        );
        assert_eq!(
            output,
            [
                (Pid::IN, true),
                (Pid::NAK, true),
                (Pid::PING, true),
                (Pid::NAK, true),
                (Pid::IN, false),
                (Pid::DATA1, false),
                (Pid::ACK, false),
            ]
        );
    }

    #[test]
    fn disabled_forwards_everything() {
        let mut filter = FilterNak::new();
        let output = run(&mut filter, &[Pid::IN, Pid::NAK, Pid::OUT, Pid::DATA1, Pid::NAK], false);
        assert!(output.iter().all(|(_, discard)| !discard));
        assert_eq!(output.len(), 5);
    }

    #[test]
    fn out_without_data_is_forwarded() {
        let mut filter = FilterNak::new();
        let output = run(&mut filter, &[Pid::OUT, Pid::NAK], true);
        assert_eq!(output, [(Pid::OUT, false), (Pid::NAK, false)]);
    }

    #[test]
    fn setup_is_never_filtered() {
        let mut filter = FilterNak::new();
        let output = run(&mut filter, &[Pid::SETUP, Pid::DATA0, Pid::NAK], true);
        assert!(output.iter().all(|(_, discard)| !discard));
    }

    #[test]
    fn split_transactions_pass() {
        let mut filter = FilterNak::new();
        let output = run(
            &mut filter,
            &[Pid::SPLIT, Pid::SPLIT, Pid::IN, Pid::NAK],
            true,
        );
        assert_eq!(
            output,
            [
                (Pid::SPLIT, false),
                (Pid::SPLIT, false),
                (Pid::IN, false),
                (Pid::NAK, false),
            ]
        );
    }

    #[test]
    fn keeps_prior_discard_when_forwarding() {
        let mut filter = FilterNak::new();
        let mut desc = packet(Pid::SOF, 0);
        desc.discard = true;
        assert!(filter.offer(&desc, true));
        assert_eq!(filter.state(), NakState::Forward);
        assert!(filter.take().unwrap().discard);
    }

    #[test]
    fn release_forwards_undecided_transaction() {
        let mut filter = FilterNak::new();
        assert!(filter.offer(&packet(Pid::OUT, 0), true));
        assert!(filter.offer(&packet(Pid::DATA0, 1), true));
        assert!(filter.is_holding());

        filter.release();
        assert_eq!(filter.state(), NakState::Forward);
        assert!(!filter.is_holding());
        assert_eq!(filter.take().map(|d| (d.pid(), d.discard)), Some((Some(Pid::OUT), false)));
        assert_eq!(filter.take().map(|d| (d.pid(), d.discard)), Some((Some(Pid::DATA0), false)));
        assert_eq!(filter.take(), None);

        // The late handshake starts nothing and is passed on.
        let output = run(&mut filter, &[Pid::NAK], true);
        assert_eq!(output, [(Pid::NAK, false)]);
    }

    #[test]
    fn release_without_hold_does_nothing() {
        let mut filter = FilterNak::new();
        filter.release();
        assert_eq!(filter.state(), NakState::Default);
        assert!(filter.offer(&packet(Pid::SOF, 0), true));
        filter.release();
        assert_eq!(filter.state(), NakState::Forward);
    }

    #[test]
    fn handshake_waits_for_next_packet() {
        let mut filter = FilterNak::new();
        assert!(filter.offer(&packet(Pid::IN, 0), true));
        assert_eq!(filter.take(), None);
        assert_eq!(filter.held(), 1);
        // A session boundary has no PID and releases the token.
        let stuff = PacketDescriptor::default();
        assert!(!filter.offer(&stuff, true));
        assert_eq!(filter.take().map(|d| d.discard), Some(false));
    }
}
