//! Save-state container.
//!
//! Layout: the 8-byte magic `DMGSNAP\0`, a little-endian `u16` format
//! version, then two MessagePack values: the [`SnapshotHeader`] and the
//! machine state. The ROM is never stored, so a snapshot only restores
//! onto the cartridge it was taken from.

use std::io::Cursor;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cartridge::{CartridgeId, CartridgeState},
    cpu::Cpu,
    dma::{Hdma, OamDma},
    input::Joypad,
    mmu::Mmu,
    ppu::Ppu,
    serial::Serial,
    sound::Sound,
    timer::Timer,
};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"DMGSNAP\0";
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("not a snapshot: bad magic")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
    #[error("snapshot belongs to {found:?}, loaded cartridge is {expected:?}")]
    CartridgeMismatch {
        expected: Option<CartridgeId>,
        found: Option<CartridgeId>,
    },
    #[error("snapshot was taken in {} mode", if *.0 { "CGB" } else { "DMG" })]
    ModeMismatch(bool),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub cartridge: Option<CartridgeId>,
    pub cgb: bool,
}

#[derive(Serialize)]
struct MachineRef<'a> {
    cpu: &'a Cpu,
    wram: &'a [u8],
    wram_bank: usize,
    hram: &'a [u8],
    if_reg: u8,
    ie_reg: u8,
    key1: u8,
    gdma_stall: u32,
    ppu: &'a Ppu,
    timer: &'a Timer,
    oam_dma: &'a OamDma,
    hdma: &'a Hdma,
    serial: &'a Serial,
    sound: &'a Sound,
    joypad: &'a Joypad,
    cart: Option<CartridgeState>,
}

#[derive(Deserialize)]
struct Machine {
    cpu: Cpu,
    wram: Vec<u8>,
    wram_bank: usize,
    hram: Vec<u8>,
    if_reg: u8,
    ie_reg: u8,
    key1: u8,
    gdma_stall: u32,
    ppu: Ppu,
    timer: Timer,
    oam_dma: OamDma,
    hdma: Hdma,
    serial: Serial,
    sound: Sound,
    joypad: Joypad,
    cart: Option<CartridgeState>,
}

/// Encode the whole machine.
pub fn save(cpu: &Cpu, mmu: &Mmu) -> Result<Vec<u8>, SnapshotError> {
    let header = SnapshotHeader {
        cartridge: mmu.cart.as_ref().map(|c| c.identity()),
        cgb: mmu.is_cgb(),
    };
    let machine = MachineRef {
        cpu,
        wram: &mmu.wram,
        wram_bank: mmu.wram_bank,
        hram: &mmu.hram,
        if_reg: mmu.if_reg,
        ie_reg: mmu.ie_reg,
        key1: mmu.key1,
        gdma_stall: mmu.gdma_stall,
        ppu: &mmu.ppu,
        timer: &mmu.timer,
        oam_dma: &mmu.oam_dma,
        hdma: &mmu.hdma,
        serial: &mmu.serial,
        sound: &mmu.sound,
        joypad: &mmu.joypad,
        cart: mmu.cart.as_ref().map(|c| c.save_state()),
    };

    let mut out = Vec::with_capacity(64 * 1024);
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    rmp_serde::encode::write(&mut out, &header)?;
    rmp_serde::encode::write(&mut out, &machine)?;
    info!("snapshot saved ({} bytes)", out.len());
    Ok(out)
}

/// Check magic and version, returning the header and the remaining bytes.
pub fn read_header(bytes: &[u8]) -> Result<(SnapshotHeader, &[u8]), SnapshotError> {
    let prefix = SNAPSHOT_MAGIC.len() + 2;
    if bytes.len() < prefix || &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let mut cursor = Cursor::new(&bytes[prefix..]);
    let header: SnapshotHeader = rmp_serde::decode::from_read(&mut cursor)?;
    let consumed = cursor.position() as usize;
    Ok((header, &bytes[prefix + consumed..]))
}

/// Replace the machine state. Nothing is touched unless the whole snapshot
/// decodes and matches the loaded cartridge.
pub fn restore(bytes: &[u8], cpu: &mut Cpu, mmu: &mut Mmu) -> Result<(), SnapshotError> {
    let (header, body) = read_header(bytes)?;
    let loaded = mmu.cart.as_ref().map(|c| c.identity());
    if header.cartridge != loaded {
        return Err(SnapshotError::CartridgeMismatch {
            expected: loaded,
            found: header.cartridge,
        });
    }
    if header.cgb != mmu.is_cgb() {
        return Err(SnapshotError::ModeMismatch(header.cgb));
    }
    let machine: Machine = rmp_serde::from_slice(body)?;

    *cpu = machine.cpu;
    mmu.wram = machine.wram;
    mmu.wram_bank = machine.wram_bank;
    mmu.hram = machine.hram;
    mmu.if_reg = machine.if_reg;
    mmu.ie_reg = machine.ie_reg;
    mmu.key1 = machine.key1;
    mmu.gdma_stall = machine.gdma_stall;
    mmu.ppu = machine.ppu;
    mmu.timer = machine.timer;
    mmu.oam_dma = machine.oam_dma;
    mmu.hdma = machine.hdma;
    mmu.serial.restore(machine.serial);
    mmu.sound.restore(machine.sound);
    mmu.joypad = machine.joypad;
    if let (Some(cart), Some(state)) = (mmu.cart.as_mut(), machine.cart) {
        cart.load_state(state);
    }
    info!("snapshot restored");
    Ok(())
}
