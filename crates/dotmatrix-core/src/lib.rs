//! Cycle-accurate Game Boy / Game Boy Color emulation kernel.
//!
//! The crate has no I/O of its own. A host builds a [`gameboy::GameBoy`],
//! attaches the collaborators from [`interfaces`] it cares about, and calls
//! [`gameboy::GameBoy::run_frame`] or [`gameboy::GameBoy::step`].

/// 8-bit arithmetic and flag computation.
pub mod alu;

/// Cartridge mappers (MBC) and ROM/RAM/RTC handling.
pub mod cartridge;

/// LR35902 CPU core.
pub mod cpu;

/// OAM DMA and CGB VRAM DMA engines.
pub mod dma;

/// High-level facade that wires the CPU and MMU into a single machine.
pub mod gameboy;

/// Joypad input register and edge-triggered interrupt behavior.
pub mod input;

/// Host collaborator traits.
pub mod interfaces;

/// Interrupt sources, priorities and vectors.
pub mod interrupt;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Background/window/sprite pixel FIFO.
pub mod pipeline;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Serial unit and link cable plumbing.
pub mod serial;

/// Save states.
pub mod snapshot;

/// Sound register file and sample clock.
pub mod sound;

/// Divider/timer unit.
pub mod timer;

pub use gameboy::{Config, GameBoy, HardwareMode};
