//! Code describing the parts of the USB standard the capture path relies on.

use crc::{Crc, CRC_16_USB};
use num_enum::{IntoPrimitive, TryFromPrimitive};

fn crc16(bytes: &[u8]) -> u16 {
    const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);
    CRC16.checksum(bytes)
}

// We can't use the CRC_5_USB implementation, because we need to
// compute the CRC over either 11 or 19 bits of data, rather than
// over an integer number of bytes.

pub fn crc5(mut input: u32, num_bits: u32) -> u8 {
    let mut state: u32 = 0x1f;
    for _ in 0..num_bits {
        let cmp = input & 1 != state & 1;
        input >>= 1;
        state >>= 1;
        if cmp {
            state ^= 0x14;
        }
    }
    (state ^ 0x1f) as u8
}

/// The 4-bit packet identifier, as carried in the low nibble of the PID byte.
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, IntoPrimitive, TryFromPrimitive, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pid {
    /// LPM extended token (USB 2.0 ECN).
    EXT   = 0b0000,
    OUT   = 0b0001,
    ACK   = 0b0010,
    DATA0 = 0b0011,
    PING  = 0b0100,
    SOF   = 0b0101,
    NYET  = 0b0110,
    DATA2 = 0b0111,
    SPLIT = 0b1000,
    IN    = 0b1001,
    NAK   = 0b1010,
    DATA1 = 0b1011,
    /// PRE on low-speed links, ERR as a split handshake.
    ERR   = 0b1100,
    SETUP = 0b1101,
    STALL = 0b1110,
    MDATA = 0b1111,
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Pid {
    /// Decode a PID byte as seen on the wire.
    ///
    /// Returns the low nibble and whether the high nibble is its complement.
    pub fn decode(byte: u8) -> (u8, bool) {
        let nibble = byte & 0x0F;
        let check = byte >> 4;
        (nibble, nibble == (!check & 0x0F))
    }

    /// Decode a PID byte, returning `None` if its check nibble is wrong.
    pub fn from_byte(byte: u8) -> Option<Pid> {
        match Pid::decode(byte) {
            (nibble, true) => Pid::try_from(nibble).ok(),
            (_, false) => None,
        }
    }

    /// The full wire byte for this PID, including its check nibble.
    pub fn to_byte(self) -> u8 {
        let nibble = u8::from(self);
        (!nibble << 4) | nibble
    }
}

/// Check a complete captured packet for correct length and CRC.
///
/// On failure, returns the PID if the first byte carried a valid one.
pub fn validate_packet(packet: &[u8]) -> Result<Pid, Option<Pid>> {
    use Pid::*;

    match packet.first().map(|byte| Pid::from_byte(*byte)) {
        // A zero-byte packet is always invalid, and has no PID.
        None => Err(None),

        // A bad check nibble means there is no usable PID at all.
        Some(None) => Err(None),

        Some(Some(pid)) => {
            let len = packet.len();
            let valid = match pid {

                // SOF and tokens must be three bytes, with a valid CRC5.
                SOF | SETUP | IN | OUT | PING if len == 3 => {
                    let data = u32::from_le_bytes(
                        [packet[1], packet[2] & 0x07, 0, 0]);
                    let crc = packet[2] >> 3;
                    crc == crc5(data, 11)
                }

                // SPLIT packets must be four bytes, with a valid CRC5.
                SPLIT if len == 4 => {
                    let data = u32::from_le_bytes(
                        [packet[1], packet[2], packet[3] & 0x07, 0]);
                    let crc = packet[3] >> 3;
                    crc == crc5(data, 19)
                },

                // Data packets must be 3 to 1027 bytes, with a valid CRC16.
                DATA0 | DATA1 | DATA2 | MDATA if (3..=1027).contains(&len) => {
                    let data = &packet[1..(len - 2)];
                    let crc = u16::from_le_bytes([packet[len - 2], packet[len - 1]]);
                    crc == crc16(data)
                }

                // Handshake packets must be a single byte.
                ACK | NAK | NYET | STALL | ERR if len == 1 => true,

                // Anything else is invalid.
                _ => false
            };

            if valid {
                Ok(pid)
            } else {
                Err(Some(pid))
            }
        }
    }
}

/// Build a token packet (SETUP, IN, OUT, PING, SOF) with a correct CRC5.
///
/// For SOF, `addr` and `endp` together carry the 11-bit frame number.
pub fn token_packet(pid: Pid, addr: u8, endp: u8) -> Vec<u8> {
    let field = u32::from(addr & 0x7F) | (u32::from(endp & 0x0F) << 7);
    let crc = crc5(field, 11);
    let bits = field | (u32::from(crc) << 11);
    vec![pid.to_byte(), bits as u8, (bits >> 8) as u8]
}

/// Build a data packet with a correct CRC16.
pub fn data_packet(pid: Pid, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(data.len() + 3);
    packet.push(pid.to_byte());
    packet.extend_from_slice(data);
    packet.extend_from_slice(&crc16(data).to_le_bytes());
    packet
}

/// Build a single-byte handshake packet.
pub fn handshake_packet(pid: Pid) -> Vec<u8> {
    vec![pid.to_byte()]
}
