//! Symbols delivered by the physical-layer receiver.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// A received data byte.
    Data(u8),
    StartOfPacket,
    /// Packet ended with no error indication.
    EndOfPacket,
    /// The receiver signalled a line level error; ends the packet.
    LineError,
    /// The receive path overflowed and the packet was clipped; ends it.
    RxOverflow,
}

/// A symbol and the tick at which it was received.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub timestamp: u64,
}

impl Symbol {
    pub fn new(kind: SymbolKind, timestamp: u64) -> Symbol {
        Symbol { kind, timestamp }
    }

    pub fn data(byte: u8, timestamp: u64) -> Symbol {
        Symbol::new(SymbolKind::Data(byte), timestamp)
    }

    pub fn is_control(&self) -> bool {
        !matches!(self.kind, SymbolKind::Data(_))
    }

    /// The symbols of a complete packet starting at `timestamp`, one per tick.
    pub fn packet(timestamp: u64, bytes: &[u8]) -> Vec<Symbol> {
        let mut symbols = Vec::with_capacity(bytes.len() + 2);
        symbols.push(Symbol::new(SymbolKind::StartOfPacket, timestamp));
        let mut tick = timestamp;
        for byte in bytes {
            tick += 1;
            symbols.push(Symbol::data(*byte, tick));
        }
        symbols.push(Symbol::new(SymbolKind::EndOfPacket, tick + 1));
        symbols
    }
}
