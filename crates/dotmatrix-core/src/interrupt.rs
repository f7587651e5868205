//! Interrupt sources, their IF/IE bits and service vectors.
//!
//! Subsystems never hold a reference to the CPU. They receive the IF
//! register as `&mut u8` for the duration of a tick and call
//! [`request`] to raise a line.

use serde::{Deserialize, Serialize};

/// Upper three bits of IF are unused and always read back as 1.
pub const IF_UNUSED_BITS: u8 = 0xE0;

/// Mask of the five implemented interrupt lines.
pub const INTERRUPT_MASK: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interrupt {
    VBlank,
    Stat,
    Timer,
    Serial,
    Joypad,
}

impl Interrupt {
    /// All sources in service priority order.
    pub const PRIORITY: [Interrupt; 5] = [
        Interrupt::VBlank,
        Interrupt::Stat,
        Interrupt::Timer,
        Interrupt::Serial,
        Interrupt::Joypad,
    ];

    pub const fn bit(self) -> u8 {
        match self {
            Interrupt::VBlank => 0x01,
            Interrupt::Stat => 0x02,
            Interrupt::Timer => 0x04,
            Interrupt::Serial => 0x08,
            Interrupt::Joypad => 0x10,
        }
    }

    pub const fn vector(self) -> u16 {
        match self {
            Interrupt::VBlank => 0x0040,
            Interrupt::Stat => 0x0048,
            Interrupt::Timer => 0x0050,
            Interrupt::Serial => 0x0058,
            Interrupt::Joypad => 0x0060,
        }
    }

    /// Highest-priority source present in `pending`, if any.
    pub fn highest(pending: u8) -> Option<Interrupt> {
        Self::PRIORITY
            .into_iter()
            .find(|source| pending & source.bit() != 0)
    }
}

#[inline]
pub fn request(if_reg: &mut u8, source: Interrupt) {
    *if_reg |= source.bit();
}
