use log::debug;
#[cfg(feature = "ppu-trace")]
use log::trace;
use serde::{Deserialize, Serialize};

use crate::interrupt::{self, Interrupt};
use crate::pipeline::{LineContext, Pipeline, PixelSource, Sprite};

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

/// Dots per scanline, visible or not.
pub const DOTS_PER_LINE: u16 = 456;
pub const OAM_SCAN_DOTS: u16 = 80;
const VBLANK_LINES: u8 = 10;
const LAST_LINE: u8 = SCREEN_HEIGHT as u8 + VBLANK_LINES - 1;
/// Dot of line 153 from which LY already reads 0.
const LINE_153_WRAP_DOT: u16 = 4;

const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

pub const VRAM_BANK_SIZE: usize = 0x2000;
pub const OAM_SIZE: usize = 0xA0;
const PAL_RAM_SIZE: usize = 0x40;
const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_UNUSED_BIT: u8 = 0x40;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

/// Default DMG palette colors in 0x00RRGGBB order.
pub const DMG_PALETTE: [u32; 4] = [0x009BBC0F, 0x008BAC0F, 0x00306230, 0x000F380F];

/// LCD mode as reported in STAT bits 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    HBlank = 0,
    VBlank = 1,
    OamScan = 2,
    Transfer = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ppu {
    /// Both VRAM banks back to back; bank 1 only exists on CGB.
    vram: Vec<u8>,
    vram_bank: usize,
    oam: Vec<u8>,

    cgb: bool,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    /// Internal window line counter
    window_line: u8,
    /// WY matched LY at some point this frame.
    wy_triggered: bool,

    bgpi: u8,
    bgpd: Vec<u8>,
    obpi: u8,
    obpd: Vec<u8>,
    /// Object priority mode register (OPRI)
    opri: u8,

    dot: u16,
    mode: Mode,

    line_sprites: Vec<Sprite>,
    pipeline: Pipeline,

    /// Frame being drawn.
    back_buffer: Vec<u32>,
    /// Last completed frame, swapped in at VBlank.
    front_buffer: Vec<u32>,
    frame_ready: bool,
    stat_irq_line: bool,
    frame_counter: u64,
}

impl Ppu {
    /// A PPU in the state the boot ROM leaves behind: LCD on, line 0, OAM scan.
    pub fn new(cgb: bool) -> Self {
        let mut ppu = Self {
            vram: vec![0; VRAM_BANK_SIZE * 2],
            vram_bank: 0,
            oam: vec![0; OAM_SIZE],
            cgb,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            window_line: 0,
            wy_triggered: false,
            bgpi: PAL_UNUSED_BIT,
            bgpd: vec![0; PAL_RAM_SIZE],
            obpi: PAL_UNUSED_BIT,
            obpd: vec![0; PAL_RAM_SIZE],
            opri: 0,
            dot: 0,
            mode: Mode::OamScan,
            line_sprites: Vec::with_capacity(MAX_SPRITES_PER_LINE),
            pipeline: Pipeline::new(0),
            back_buffer: vec![DMG_PALETTE[0]; SCREEN_WIDTH * SCREEN_HEIGHT],
            front_buffer: vec![DMG_PALETTE[0]; SCREEN_WIDTH * SCREEN_HEIGHT],
            frame_ready: false,
            stat_irq_line: false,
            frame_counter: 0,
        };
        ppu.apply_boot_state();
        ppu
    }

    fn apply_boot_state(&mut self) {
        self.lcdc = 0x91;
        self.bgp = 0xFC;
        self.stat = 0x00;
        self.ly = 0;
        self.dot = 0;
        self.mode = Mode::OamScan;
        self.window_line = 0;
        self.lyc_eq_ly = self.ly == self.lyc;
        self.stat_irq_line = false;
        if self.cgb {
            // The CGB boot ROM leaves every palette entry white.
            self.bgpd.fill(0xFF);
            self.obpd.fill(0xFF);
        }
    }

    /// Load the default CGB palettes used when running a DMG cartridge in
    /// compatibility mode. These values are based on the behavior of the
    /// official boot ROM.
    pub fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];

        let (obj0, rest) = self.obpd.split_at_mut(8);
        let (obj1, _) = rest.split_at_mut(8);
        Self::write_palette(obj0, OBJ_PAL);
        Self::write_palette(obj1, OBJ_PAL);

        let (bg0, _) = self.bgpd.split_at_mut(8);
        Self::write_palette(bg0, BG_PAL);

        self.bgp = 0xE4;
        self.obp0 = 0xD0;
        self.obp1 = 0xE0;
    }

    fn write_palette(slice: &mut [u8], pal: [u16; 4]) {
        for (i, &c) in pal.iter().enumerate() {
            slice[i * 2] = (c & 0xFF) as u8;
            slice[i * 2 + 1] = (c >> 8) as u8;
        }
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn ly(&self) -> u8 {
        self.ly
    }

    /// Dot within the current scanline.
    pub fn dot(&self) -> u16 {
        self.dot
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    pub fn in_hblank(&self) -> bool {
        self.mode == Mode::HBlank
    }

    pub fn window_line_counter(&self) -> u8 {
        self.window_line
    }

    /// Sprites selected by the last OAM scan, in drawing priority order.
    pub fn line_sprites(&self) -> &[Sprite] {
        &self.line_sprites
    }

    /// Returns true if a full frame has been rendered and is ready to display.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    pub fn clear_frame_flag(&mut self) {
        self.frame_ready = false;
    }

    /// The last completed frame, 0x00RRGGBB, row-major.
    pub fn front_buffer(&self) -> &[u32] {
        &self.front_buffer
    }

    /// Frames completed since power on.
    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    /// VRAM is closed to the CPU only while pixels are being fetched.
    pub fn vram_accessible(&self) -> bool {
        !(self.lcd_enabled() && self.mode == Mode::Transfer)
    }

    /// OAM is closed to the CPU during OAM scan and pixel transfer. DMA
    /// blocking is the bus's concern.
    pub fn oam_accessible(&self) -> bool {
        !(self.lcd_enabled() && matches!(self.mode, Mode::OamScan | Mode::Transfer))
    }

    pub fn vram_bank(&self) -> usize {
        self.vram_bank
    }

    pub fn set_vram_bank(&mut self, bank: u8) {
        if self.cgb {
            self.vram_bank = (bank & 0x01) as usize;
        }
    }

    fn vram_index(&self, addr: u16) -> usize {
        if !(0x8000..=0x9FFF).contains(&addr) {
            panic!("VRAM address out of range: {addr:04X}");
        }
        self.vram_bank * VRAM_BANK_SIZE + (addr - 0x8000) as usize
    }

    fn oam_index(addr: u16) -> usize {
        if !(0xFE00..0xFE00 + OAM_SIZE as u16).contains(&addr) {
            panic!("OAM address out of range: {addr:04X}");
        }
        (addr - 0xFE00) as usize
    }

    /// CPU read from 0x8000-0x9FFF in the selected bank.
    pub fn read_vram(&self, addr: u16) -> u8 {
        let idx = self.vram_index(addr);
        if self.vram_accessible() {
            self.vram[idx]
        } else {
            0xFF
        }
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        let idx = self.vram_index(addr);
        if self.vram_accessible() {
            self.vram[idx] = val;
        }
    }

    /// VRAM write on behalf of HDMA/GDMA, which ignores the mode lock.
    pub fn write_vram_dma(&mut self, addr: u16, val: u8) {
        let idx = self.vram_index(addr);
        self.vram[idx] = val;
    }

    /// Direct read of either bank, for debuggers and tests.
    pub fn vram_bank_byte(&self, bank: usize, addr: u16) -> u8 {
        if !(0x8000..=0x9FFF).contains(&addr) || bank > 1 {
            panic!("VRAM address out of range: {addr:04X}");
        }
        self.vram[bank * VRAM_BANK_SIZE + (addr - 0x8000) as usize]
    }

    pub fn read_oam(&self, addr: u16) -> u8 {
        let idx = Self::oam_index(addr);
        if self.oam_accessible() {
            self.oam[idx]
        } else {
            0xFF
        }
    }

    pub fn write_oam(&mut self, addr: u16, val: u8) {
        let idx = Self::oam_index(addr);
        if self.oam_accessible() {
            self.oam[idx] = val;
        }
    }

    /// OAM write from sprite-table DMA, which reaches the table in any mode.
    pub fn write_oam_dma(&mut self, index: usize, val: u8) {
        if index >= OAM_SIZE {
            panic!("OAM address out of range: {:04X}", 0xFE00 + index);
        }
        self.oam[index] = val;
    }

    fn decode_cgb_color(lo: u8, hi: u8) -> u32 {
        let raw = ((hi as u16) << 8) | lo as u16;
        let expand = |c: u16| -> u32 {
            let c = (c & 0x1F) as u8;
            ((c << 3) | (c >> 2)) as u32
        };
        (expand(raw) << 16) | (expand(raw >> 5) << 8) | expand(raw >> 10)
    }

    /// Get a CGB background palette color as 0x00RRGGBB.
    pub fn bg_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.bgpd[off], self.bgpd[off + 1])
    }

    pub fn ob_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.obpd[off], self.obpd[off + 1])
    }

    fn sanitize_palette_index(value: u8) -> u8 {
        (value & (PAL_AUTO_INCREMENT_BIT | PAL_INDEX_MASK)) | PAL_UNUSED_BIT
    }

    fn palette_ram_index(index: u8) -> usize {
        (index & PAL_INDEX_MASK) as usize
    }

    fn step_palette_index(index: &mut u8) {
        let current = *index;
        let idx = current & PAL_INDEX_MASK;
        let next_idx = if current & PAL_AUTO_INCREMENT_BIT != 0 {
            idx.wrapping_add(1) & PAL_INDEX_MASK
        } else {
            idx
        };
        *index = (current & PAL_AUTO_INCREMENT_BIT) | PAL_UNUSED_BIT | next_idx;
    }

    fn update_lyc_compare(&mut self) {
        if self.lcd_enabled() {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
    }

    /// Palette data reads do not advance the auto-increment index.
    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                (self.stat & 0x78)
                    | 0x80
                    | self.mode as u8
                    | if self.lyc_eq_ly { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF4F if self.cgb => 0xFE | self.vram_bank as u8,
            0xFF68 if self.cgb => self.bgpi,
            0xFF69 if self.cgb => self.bgpd[Self::palette_ram_index(self.bgpi)],
            0xFF6A if self.cgb => self.obpi,
            0xFF6B if self.cgb => self.obpd[Self::palette_ram_index(self.obpi)],
            0xFF6C if self.cgb => self.opri | 0xFE,
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcd_enabled();
                self.lcdc = val;
                let now_on = self.lcd_enabled();
                if was_on && !now_on {
                    debug!("LCD off at LY={}", self.ly);
                    self.mode = Mode::HBlank;
                    self.dot = 0;
                    self.ly = 0;
                    self.window_line = 0;
                    self.wy_triggered = false;
                    self.line_sprites.clear();
                    self.pipeline = Pipeline::new(self.scx);
                    self.stat_irq_line = false;
                } else if !was_on && now_on {
                    debug!("LCD on");
                    self.mode = Mode::OamScan;
                    self.dot = 0;
                    self.update_lyc_compare();
                    self.update_stat_irq(if_reg);
                }
            }
            0xFF41 => {
                self.stat = val & 0x78;
                self.update_stat_irq(if_reg);
            }
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.update_lyc_compare();
                self.update_stat_irq(if_reg);
            }
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF4F => self.set_vram_bank(val),
            0xFF68 if self.cgb => self.bgpi = Self::sanitize_palette_index(val),
            0xFF69 if self.cgb => {
                let idx = Self::palette_ram_index(self.bgpi);
                self.bgpd[idx] = val;
                Self::step_palette_index(&mut self.bgpi);
            }
            0xFF6A if self.cgb => self.obpi = Self::sanitize_palette_index(val),
            0xFF6B if self.cgb => {
                let idx = Self::palette_ram_index(self.obpi);
                self.obpd[idx] = val;
                Self::step_palette_index(&mut self.obpi);
            }
            0xFF6C if self.cgb => self.opri = val & 0x01,
            _ => {}
        }
    }

    /// Sprites are drawn in X order unless CGB OAM-order priority is active.
    fn x_priority(&self) -> bool {
        !self.cgb || self.opri & 0x01 != 0
    }

    /// Select up to 10 sprites overlapping the current line.
    fn oam_scan(&mut self, oam_dma_active: bool) {
        self.line_sprites.clear();
        if oam_dma_active {
            // The scan reads 0xFF while DMA owns OAM and matches nothing.
            return;
        }
        let height: u16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        let line = self.ly as u16 + 16;
        for i in 0..TOTAL_SPRITES {
            let sprite = Sprite::from_oam(&self.oam, i);
            let y = sprite.y as u16;
            if y <= line && y + height > line {
                self.line_sprites.push(sprite);
            }
        }
        if self.x_priority() {
            self.line_sprites.sort_by_key(|s| s.x);
        }
        self.line_sprites.truncate(MAX_SPRITES_PER_LINE);
    }

    #[inline(always)]
    fn dmg_shade(palette: u8, color_id: u8) -> u8 {
        (palette >> (color_id * 2)) & 0x03
    }

    fn resolve_color(&self, color: u8, source: PixelSource) -> u32 {
        match (self.cgb, source) {
            (false, PixelSource::Background { .. }) => {
                if self.lcdc & 0x01 == 0 {
                    DMG_PALETTE[0]
                } else {
                    DMG_PALETTE[Self::dmg_shade(self.bgp, color) as usize]
                }
            }
            (false, PixelSource::Object { palette }) => {
                let obp = if palette == 0 { self.obp0 } else { self.obp1 };
                DMG_PALETTE[Self::dmg_shade(obp, color) as usize]
            }
            (true, PixelSource::Background { palette }) => {
                self.bg_palette_color(palette as usize, color as usize)
            }
            (true, PixelSource::Object { palette }) => {
                self.ob_palette_color(palette as usize, color as usize)
            }
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        #[cfg(feature = "ppu-trace")]
        trace!("LY={:3} dot={:3} {:?} -> {:?}", self.ly, self.dot, self.mode, mode);
        self.mode = mode;
    }

    fn start_transfer(&mut self) {
        self.pipeline = Pipeline::new(self.scx);
        self.set_mode(Mode::Transfer);
    }

    fn transfer_dot(&mut self) {
        let ctx = LineContext {
            vram: &self.vram,
            sprites: &self.line_sprites,
            cgb: self.cgb,
            lcdc: self.lcdc,
            scx: self.scx,
            scy: self.scy,
            ly: self.ly,
            wx: self.wx,
            wy_triggered: self.wy_triggered,
            window_line: self.window_line,
            oam_order_priority: !self.x_priority(),
        };
        if let Some(px) = self.pipeline.tick(&ctx) {
            let rgb = self.resolve_color(px.color, px.source);
            let offset = self.ly as usize * SCREEN_WIDTH + px.x as usize;
            self.back_buffer[offset] = rgb;
        }
    }

    /// Advance `dots` PPU clocks. Returns true when HBlank was entered during
    /// this call, which is when an HBlank DMA block may run.
    pub fn step(&mut self, dots: u16, if_reg: &mut u8, oam_dma_active: bool) -> bool {
        if !self.lcd_enabled() {
            return false;
        }
        let mut hblank_entered = false;
        for _ in 0..dots {
            hblank_entered |= self.tick(if_reg, oam_dma_active);
        }
        hblank_entered
    }

    fn tick(&mut self, if_reg: &mut u8, oam_dma_active: bool) -> bool {
        let mut hblank_entered = false;
        self.dot += 1;

        match self.mode {
            Mode::OamScan => {
                if self.dot == 1 {
                    if self.ly == self.wy {
                        self.wy_triggered = true;
                    }
                    self.oam_scan(oam_dma_active);
                }
                if self.dot >= OAM_SCAN_DOTS {
                    self.start_transfer();
                }
            }
            Mode::Transfer => {
                self.transfer_dot();
                if self.pipeline.line_done() {
                    self.set_mode(Mode::HBlank);
                    hblank_entered = true;
                }
            }
            Mode::HBlank => {
                if self.dot >= DOTS_PER_LINE {
                    self.dot = 0;
                    if self.pipeline.window_rendered() {
                        self.window_line = self.window_line.wrapping_add(1);
                    }
                    self.ly += 1;
                    if self.ly as usize == SCREEN_HEIGHT {
                        self.enter_vblank(if_reg);
                    } else {
                        self.set_mode(Mode::OamScan);
                    }
                }
            }
            Mode::VBlank => {
                if self.ly == LAST_LINE && self.dot == LINE_153_WRAP_DOT {
                    self.ly = 0;
                }
                if self.dot >= DOTS_PER_LINE {
                    self.dot = 0;
                    if self.ly == 0 {
                        self.window_line = 0;
                        self.wy_triggered = false;
                        self.set_mode(Mode::OamScan);
                    } else {
                        self.ly += 1;
                    }
                }
            }
        }

        self.update_lyc_compare();
        self.update_stat_irq(if_reg);
        hblank_entered
    }

    fn enter_vblank(&mut self, if_reg: &mut u8) {
        self.set_mode(Mode::VBlank);
        interrupt::request(if_reg, Interrupt::VBlank);
        std::mem::swap(&mut self.front_buffer, &mut self.back_buffer);
        self.frame_ready = true;
        self.frame_counter = self.frame_counter.wrapping_add(1);
    }

    /// STAT requests fire on the rising edge of the OR of all enabled sources.
    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        if !self.lcd_enabled() {
            self.stat_irq_line = false;
            return;
        }
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let mode_signal = match self.mode {
            Mode::HBlank => self.stat & 0x08 != 0,
            Mode::VBlank => self.stat & 0x10 != 0,
            Mode::OamScan => self.stat & 0x20 != 0,
            Mode::Transfer => false,
        };
        let current = coincidence || mode_signal;
        if current && !self.stat_irq_line {
            interrupt::request(if_reg, Interrupt::Stat);
        }
        self.stat_irq_line = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgb_color_expands_five_bit_channels() {
        assert_eq!(Ppu::decode_cgb_color(0xFF, 0x7F), 0x00FF_FFFF);
        assert_eq!(Ppu::decode_cgb_color(0x1F, 0x00), 0x00FF_0000);
        assert_eq!(Ppu::decode_cgb_color(0x00, 0x7C), 0x0000_00FF);
    }

    #[test]
    fn palette_index_auto_increments_and_wraps() {
        let mut ppu = Ppu::new(true);
        let mut if_reg = 0;
        ppu.write_reg(0xFF68, 0xBF, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF68), 0xFF);
        ppu.write_reg(0xFF69, 0x12, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF68), 0xC0);
        ppu.write_reg(0xFF68, 0x3F, &mut if_reg);
        assert_eq!(ppu.read_reg(0xFF69), 0x12);
    }

    #[test]
    fn dmg_hides_cgb_registers() {
        let ppu = Ppu::new(false);
        for addr in [0xFF4F, 0xFF68, 0xFF69, 0xFF6A, 0xFF6B, 0xFF6C] {
            assert_eq!(ppu.read_reg(addr), 0xFF, "{addr:04X}");
        }
    }

    #[test]
    #[should_panic(expected = "VRAM address out of range: 7FFF")]
    fn vram_access_outside_region_is_fatal() {
        let ppu = Ppu::new(false);
        ppu.read_vram(0x7FFF);
    }
}
