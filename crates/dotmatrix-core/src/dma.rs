//! Sprite-table (OAM) DMA and the CGB general/HBlank VRAM DMA.
//!
//! Both engines only hold their own progress counters. The byte moves
//! themselves go through [`crate::mmu::Mmu`], which owns every memory
//! region involved.

use log::debug;
use serde::{Deserialize, Serialize};

/// Machine cycles between the FF46 write and the first byte copied.
pub const OAM_DMA_START_DELAY: u8 = 2;
/// Bytes copied by one OAM DMA, one per machine cycle.
pub const OAM_DMA_LEN: u8 = 0xA0;

pub const HDMA_BLOCK_LEN: u16 = 0x10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OamDma {
    active: bool,
    page: u8,
    byte: u8,
    start_delay: u8,
}

impl OamDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transfer from `page * 0x100`. Restarting mid-transfer starts
    /// over from the first byte.
    pub fn start(&mut self, page: u8) {
        debug!("OAM DMA from {:04X}", (page as u16) << 8);
        self.active = true;
        self.page = page;
        self.byte = 0;
        self.start_delay = OAM_DMA_START_DELAY;
    }

    /// Advance one machine cycle. Returns the `(source, oam_index)` pair the
    /// bus must copy during this cycle, if any.
    pub fn tick(&mut self) -> Option<(u16, usize)> {
        if !self.active {
            return None;
        }
        if self.start_delay > 0 {
            self.start_delay -= 1;
            return None;
        }
        let index = self.byte;
        let src = ((self.page as u16) << 8) | index as u16;
        self.byte += 1;
        self.active = self.byte < OAM_DMA_LEN;
        Some((src, index as usize))
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Last page written to FF46.
    pub fn page(&self) -> u8 {
        self.page
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VramDmaMode {
    /// General-purpose: the whole length is copied at once.
    General,
    /// One block per HBlank.
    HBlank,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hdma {
    /// Source pointer; the low nibble is always clear.
    src: u16,
    /// Destination inside VRAM, kept as `0x8000 | (dst & 0x1FF0)`.
    dst: u16,
    /// Remaining 16-byte blocks.
    blocks: u8,
    mode: VramDmaMode,
    active: bool,
    cancelled: bool,
}

/// What the bus must do after an FF55 write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdmaRequest {
    None,
    /// Copy `blocks` blocks immediately and stall the CPU.
    General { blocks: u8 },
    /// An HBlank transfer was armed.
    HBlankArmed,
}

impl Hdma {
    pub fn new() -> Self {
        Self {
            src: 0,
            dst: sanitize_dst(0),
            blocks: 0,
            mode: VramDmaMode::General,
            active: false,
            cancelled: false,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF51 => (self.src >> 8) as u8,
            0xFF52 => (self.src & 0x00F0) as u8,
            0xFF53 => ((self.dst & 0x1F00) >> 8) as u8,
            0xFF54 => (self.dst & 0x00F0) as u8,
            0xFF55 => {
                if self.active {
                    // Bit 7 clear while running, low bits give blocks left minus one.
                    self.blocks.saturating_sub(1) & 0x7F
                } else if self.cancelled {
                    // The remaining length survives a cancel.
                    0x80 | (self.blocks.saturating_sub(1) & 0x7F)
                } else {
                    0xFF
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) -> HdmaRequest {
        match addr {
            0xFF51 => self.src = ((val as u16) << 8) | (self.src & 0x00F0),
            0xFF52 => self.src = (self.src & 0xFF00) | (val & 0xF0) as u16,
            0xFF53 => self.dst = sanitize_dst(((val as u16) << 8) | (self.dst & 0x00F0)),
            0xFF54 => self.dst = sanitize_dst((self.dst & 0x1F00) | (val & 0xF0) as u16),
            0xFF55 => return self.control(val),
            _ => {}
        }
        HdmaRequest::None
    }

    fn control(&mut self, val: u8) -> HdmaRequest {
        let blocks = (val & 0x7F) + 1;
        if self.active && val & 0x80 == 0 {
            debug!("HDMA cancelled with {} blocks left", self.blocks);
            self.active = false;
            self.cancelled = true;
            return HdmaRequest::None;
        }
        self.cancelled = false;
        if val & 0x80 == 0 {
            debug!(
                "GDMA {:04X} -> {:04X}, {} blocks",
                self.src, self.dst, blocks
            );
            self.mode = VramDmaMode::General;
            self.blocks = 0;
            self.active = false;
            HdmaRequest::General { blocks }
        } else {
            debug!(
                "HDMA {:04X} -> {:04X}, {} blocks",
                self.src, self.dst, blocks
            );
            self.mode = VramDmaMode::HBlank;
            self.blocks = blocks;
            self.active = true;
            HdmaRequest::HBlankArmed
        }
    }

    /// True while an HBlank transfer still has blocks to move.
    pub fn hblank_pending(&self) -> bool {
        self.active && self.mode == VramDmaMode::HBlank
    }

    /// Source and destination of the next byte, advancing both pointers.
    pub fn next_byte(&mut self) -> (u16, u16) {
        let pair = (self.src, self.dst);
        self.src = self.src.wrapping_add(1);
        self.dst = 0x8000 | (self.dst.wrapping_add(1) & 0x1FFF);
        pair
    }

    /// Account for one finished block.
    pub fn finish_block(&mut self) {
        self.blocks = self.blocks.saturating_sub(1);
        if self.blocks == 0 {
            self.active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for Hdma {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn sanitize_dst(addr: u16) -> u16 {
    0x8000 | (addr & 0x1FF0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oam_dma_waits_then_copies_one_byte_per_cycle() {
        let mut dma = OamDma::new();
        dma.start(0xC1);
        assert_eq!(dma.tick(), None);
        assert_eq!(dma.tick(), None);
        assert_eq!(dma.tick(), Some((0xC100, 0)));
        assert_eq!(dma.tick(), Some((0xC101, 1)));
        let mut copied = 2;
        while dma.tick().is_some() {
            copied += 1;
        }
        assert_eq!(copied, OAM_DMA_LEN as usize);
        assert!(!dma.is_active());
        assert_eq!(dma.page(), 0xC1);
    }

    #[test]
    fn hdma_registers_mask_addresses() {
        let mut hdma = Hdma::new();
        hdma.write(0xFF51, 0xC1);
        hdma.write(0xFF52, 0x2F);
        hdma.write(0xFF53, 0xFF);
        hdma.write(0xFF54, 0x3F);
        assert_eq!(hdma.next_byte(), (0xC120, 0x9F30));
    }

    #[test]
    fn hdma_cancel_reports_bit7() {
        let mut hdma = Hdma::new();
        assert_eq!(hdma.write(0xFF55, 0x83), HdmaRequest::HBlankArmed);
        assert_eq!(hdma.read(0xFF55), 0x03);
        hdma.finish_block();
        assert_eq!(hdma.read(0xFF55), 0x02);
        assert_eq!(hdma.write(0xFF55, 0x00), HdmaRequest::None);
        assert_eq!(hdma.read(0xFF55), 0x82);
        assert_eq!(hdma.write(0xFF55, 0x01), HdmaRequest::General { blocks: 2 });
    }
}
