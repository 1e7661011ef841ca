//! Packet descriptors passed from the producer to the consumer.

use crate::usb::Pid;

/// 1 byte PID + 1024 bytes of high-speed isochronous data + 2 byte CRC.
pub const MAX_PACKET_SIZE: u16 = 1027;

/// Largest value the 13-bit packet size counter can hold.
pub const COUNT_LIMIT: u16 = (1 << 13) - 1;

bitfield! {
    /// Per-packet flags, laid out as in the frame flags byte.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Flags(u8);
    impl Debug;
    /// Line level error signalled by the receiver during the packet.
    pub bool, err, set_err: 0;
    /// Receive path overflow; data was lost before this packet.
    pub bool, ovf, set_ovf: 1;
    /// Clipped by a filter. Reserved, never set.
    pub bool, clip, set_clip: 2;
    /// More bytes were received than captured.
    pub bool, trunc, set_trunc: 3;
    /// First packet of a capture session.
    pub bool, first, set_first: 4;
    /// Last packet of a capture session.
    pub bool, last, set_last: 5;
}

impl Flags {
    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Metadata describing one captured packet held in the ring buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Tick at which the packet started.
    pub timestamp: u64,
    /// Low nibble of the first byte. Do not use unless `pid_valid` is set.
    pub pid: u8,
    pub pid_valid: bool,
    /// Set by a filter to drop the packet from the output.
    pub discard: bool,
    /// Capture flags. TRUNC is never stored; it is derived from `count`.
    pub flags: Flags,
    /// Ring buffer offset of the first captured byte.
    pub start: usize,
    /// Bytes received, saturating at 13 bits. At most `MAX_PACKET_SIZE`
    /// of them are in the ring buffer.
    pub count: u16,
}

impl PacketDescriptor {
    /// A zero-length packet marking a capture session boundary.
    pub fn stuff(timestamp: u64, start: usize, flags: Flags) -> PacketDescriptor {
        PacketDescriptor {
            timestamp,
            start,
            flags,
            ..Default::default()
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        if self.pid_valid {
            Pid::try_from(self.pid).ok()
        } else {
            None
        }
    }

    pub fn is_stuff(&self) -> bool {
        self.flags.first() || self.flags.last()
    }

    pub fn is_truncated(&self) -> bool {
        self.count > MAX_PACKET_SIZE
    }

    /// Number of payload bytes actually held in the ring buffer.
    pub fn captured_len(&self) -> u16 {
        self.count.min(MAX_PACKET_SIZE)
    }

    /// Flags as they appear in the frame header, with TRUNC derived.
    pub fn header_flags(&self) -> Flags {
        let mut flags = self.flags;
        flags.set_trunc(self.is_truncated());
        flags
    }
}
