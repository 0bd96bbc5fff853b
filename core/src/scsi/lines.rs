//! Signal line interface
//!
//! Everything above this layer sees the bus as a set of logical lines, with
//! `true` meaning asserted regardless of the electrical polarity. Real GPIO
//! backends, the simulated bus and test doubles all implement [`SignalLines`].

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoStaticStr};

/// Individual control signals. The discriminant is the bit position in [`Lines`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumIter)]
pub enum Signal {
    Bsy = 0,
    Sel = 1,
    Atn = 2,
    Rst = 3,
    Req = 4,
    Ack = 5,
    Msg = 6,
    Cd = 7,
    Io = 8,
}

impl Signal {
    pub const fn mask(self) -> Lines {
        Lines(1 << self as u16)
    }
}

bitfield! {
    /// Set of control lines
    #[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
    pub struct Lines(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// (MSG, C/D, I/O) packed as a phase code
        pub phase_bits: u8 @ 6..=8,

        pub bsy: bool @ 0,
        pub sel: bool @ 1,
        pub atn: bool @ 2,
        pub rst: bool @ 3,
        pub req: bool @ 4,
        pub ack: bool @ 5,
        pub msg: bool @ 6,
        pub cd: bool @ 7,
        pub io: bool @ 8,
    }
}

impl Lines {
    pub const NONE: Self = Self(0);
    pub const PHASE: Self = Self(0b1_1100_0000);

    pub const fn contains(self, signal: Signal) -> bool {
        self.0 & signal.mask().0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

bitfield! {
    /// Data bus DB0-DB15 with the parity lines of both bytes
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DataBus(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        pub word: u16 @ 0..=15,
        pub low: u8 @ 0..=7,
        pub high: u8 @ 8..=15,
        pub dbp0: bool @ 16,
        pub dbp1: bool @ 17,
    }
}

impl DataBus {
    /// Single byte with its parity bit
    pub fn narrow(val: u8) -> Self {
        Self(0).with_low(val).with_dbp0(parity_bit(val))
    }

    /// Wide word, low byte on DB0-7
    pub fn wide(val: u16) -> Self {
        let [lo, hi] = val.to_le_bytes();
        Self(0)
            .with_word(val)
            .with_dbp0(parity_bit(lo))
            .with_dbp1(parity_bit(hi))
    }

    pub fn low_parity_ok(self) -> bool {
        self.dbp0() == parity_bit(self.low())
    }

    pub fn high_parity_ok(self) -> bool {
        self.dbp1() == parity_bit(self.high())
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

const fn build_parity_table() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        // Odd parity: the parity line makes the total number of ones odd
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1;
    }
    table
}

/// Parity line state for every byte value
pub static ODD_PARITY: [bool; 256] = build_parity_table();

pub fn parity_bit(val: u8) -> bool {
    ODD_PARITY[val as usize]
}

/// Edges observed on the bus in one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Edges {
    pub rising: Lines,
    pub falling: Lines,
}

/// Access to the physical (or simulated) bus lines of one device.
///
/// `sense` returns the bus as seen on the wire, including lines driven by
/// this device. `driven` returns only what this device drives.
pub trait SignalLines {
    fn sense(&self) -> Lines;
    fn driven(&self) -> Lines;

    /// Flips the driven state of every line in `mask` in one step
    fn toggle(&mut self, mask: Lines);

    fn data_bus(&self) -> DataBus;
    fn drive_data_bus(&mut self, value: DataBus);
    fn release_data_bus(&mut self);

    /// Returns whether an assert edge was latched on `signal` since the
    /// previous call, clearing the latch.
    fn take_edge(&self, signal: Signal) -> bool;

    fn delay_ns(&self, ns: u32);

    fn get(&self, signal: Signal) -> bool {
        self.sense().contains(signal)
    }

    fn set(&mut self, signal: Signal, asserted: bool) {
        if self.driven().contains(signal) != asserted {
            self.toggle(signal.mask());
        }
    }

    /// Releases every control line and the data bus
    fn release_all(&mut self) {
        let driven = self.driven();
        if !driven.is_empty() {
            self.toggle(driven);
        }
        self.release_data_bus();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn signal_bits_match_bitfield() {
        let all = Signal::iter().fold(Lines::NONE, |acc, s| acc.union(s.mask()));
        assert!(all.bsy() && all.sel() && all.atn() && all.rst());
        assert!(all.req() && all.ack() && all.msg() && all.cd() && all.io());
        assert_eq!(all.0, 0x1FF);
        assert_eq!(Lines::PHASE.phase_bits(), 0b111);
        assert_eq!(
            Lines::PHASE,
            Signal::Msg.mask().union(Signal::Cd.mask()).union(Signal::Io.mask())
        );
    }

    #[test]
    fn parity_table() {
        assert!(parity_bit(0x00));
        assert!(!parity_bit(0x01));
        assert!(!parity_bit(0x80));
        assert!(parity_bit(0x03));
        assert!(!parity_bit(0xFE));
        assert!(parity_bit(0xFF));
        for v in 0..=255u8 {
            let ones = v.count_ones() + u32::from(parity_bit(v));
            assert_eq!(ones % 2, 1, "{:02X}", v);
        }
    }

    #[test]
    fn databus_parity() {
        let db = DataBus::narrow(0x5A);
        assert_eq!(db.low(), 0x5A);
        assert!(db.low_parity_ok());

        let flipped = db.with_low(0x5B);
        assert!(!flipped.low_parity_ok());

        let w = DataBus::wide(0x1234);
        assert_eq!(w.low(), 0x34);
        assert_eq!(w.high(), 0x12);
        assert!(w.low_parity_ok());
        assert!(w.high_parity_ok());
    }
}
