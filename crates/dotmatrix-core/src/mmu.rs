use log::{debug, info};

use crate::{
    cartridge::Cartridge,
    dma::{HDMA_BLOCK_LEN, Hdma, HdmaRequest, OamDma},
    input::Joypad,
    interrupt::{IF_UNUSED_BITS, INTERRUPT_MASK},
    ppu::Ppu,
    serial::Serial,
    sound::Sound,
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;
const WRAM_BANKS: usize = 8;
const HRAM_SIZE: usize = 0x7F;

/// Machine cycles the CPU loses per 16-byte VRAM DMA block.
const HDMA_BLOCK_STALL: u32 = 8;
const HDMA_BLOCK_STALL_DOUBLE: u32 = 16;

/// Dots per machine cycle.
const DOTS_PER_M_CYCLE: u16 = 4;
const DOTS_PER_M_CYCLE_DOUBLE: u16 = 2;
/// CPU clocks per machine cycle, in either speed.
const CLOCKS_PER_M_CYCLE: u16 = 4;

/// Address-space router. Owns every memory region and I/O block and
/// advances them together in [`Mmu::tick`].
pub struct Mmu {
    pub wram: Vec<u8>,
    pub wram_bank: usize,
    pub hram: Vec<u8>,
    pub cart: Option<Cartridge>,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub serial: Serial,
    pub ppu: Ppu,
    pub sound: Sound,
    pub timer: Timer,
    pub joypad: Joypad,
    pub oam_dma: OamDma,
    pub hdma: Hdma,
    pub key1: u8,
    /// Machine cycles the CPU must still sit out for VRAM DMA.
    pub gdma_stall: u32,
    cgb_mode: bool,
}

impl Mmu {
    pub fn new(cgb: bool, sample_rate: u32) -> Self {
        Self {
            wram: vec![0; WRAM_BANK_SIZE * WRAM_BANKS],
            wram_bank: 1,
            hram: vec![0; HRAM_SIZE],
            cart: None,
            if_reg: 0xE1,
            ie_reg: 0,
            serial: Serial::new(cgb),
            ppu: Ppu::new(cgb),
            sound: Sound::new(sample_rate),
            timer: Timer::new(),
            joypad: Joypad::new(),
            oam_dma: OamDma::new(),
            hdma: Hdma::new(),
            key1: 0,
            gdma_stall: 0,
            cgb_mode: cgb,
        }
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        let is_dmg = !cart.cgb;
        self.cart = Some(cart);
        if self.cgb_mode && is_dmg {
            info!("running DMG cartridge with CGB compatibility palettes");
            self.ppu.apply_dmg_compatibility_palettes();
        }
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb_mode
    }

    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    /// Perform a pending speed switch. Returns true if KEY1 was armed.
    pub fn switch_speed(&mut self) -> bool {
        if !self.cgb_mode || self.key1 & 0x01 == 0 {
            return false;
        }
        self.key1 = (self.key1 ^ 0x80) & 0x80;
        info!(
            "switched to {} speed",
            if self.double_speed() { "double" } else { "normal" }
        );
        true
    }

    /// Advance every clocked subsystem by `m_cycles` machine cycles.
    pub fn tick(&mut self, m_cycles: u32) {
        for _ in 0..m_cycles {
            self.tick_m_cycle();
        }
    }

    fn tick_m_cycle(&mut self) {
        let prev_div = self.timer.div;
        self.timer.step(CLOCKS_PER_M_CYCLE, &mut self.if_reg);

        let dots = if self.double_speed() {
            DOTS_PER_M_CYCLE_DOUBLE
        } else {
            DOTS_PER_M_CYCLE
        };
        let hblank = self
            .ppu
            .step(dots, &mut self.if_reg, self.oam_dma.is_active());
        if hblank && self.hdma.hblank_pending() {
            self.run_hdma_block();
        }

        if let Some((src, idx)) = self.oam_dma.tick() {
            let val = self.dma_read(src);
            self.ppu.write_oam_dma(idx, val);
        }

        self.serial.step(prev_div, self.timer.div, &mut self.if_reg);
        self.sound.step(dots);
        if let Some(cart) = self.cart.as_mut() {
            cart.step_rtc(dots as u32);
        }
    }

    /// Read as seen by the DMA engines: no mode locks, and the upper pages
    /// fold back onto work RAM.
    fn dma_read(&self, addr: u16) -> u8 {
        let addr = if addr >= 0xE000 { addr - 0x2000 } else { addr };
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_ref().map_or(0xFF, |c| c.read(addr))
            }
            0x8000..=0x9FFF => self.ppu.vram_bank_byte(self.ppu.vram_bank(), addr),
            _ => self.wram[self.wram_index(addr)],
        }
    }

    fn wram_index(&self, addr: u16) -> usize {
        match addr {
            0xC000..=0xCFFF => (addr - 0xC000) as usize,
            _ => self.wram_bank * WRAM_BANK_SIZE + (addr as usize & 0x0FFF),
        }
    }

    fn oam_blocked(&self) -> bool {
        self.oam_dma.is_active() || !self.ppu.oam_accessible()
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_ref().map_or(0xFF, |c| c.read(addr))
            }
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xC000..=0xFDFF => self.wram[self.wram_index(addr & 0xDFFF)],
            0xFE00..=0xFE9F => {
                if self.oam_dma.is_active() {
                    0xFF
                } else {
                    self.ppu.read_oam(addr)
                }
            }
            0xFEA0..=0xFEFF => {
                if self.oam_blocked() {
                    0xFF
                } else if self.cgb_mode {
                    let hi = (addr & 0xF0) as u8;
                    hi | (hi >> 4)
                } else {
                    0x00
                }
            }
            0xFF00..=0xFF7F => self.read_io(addr),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
        }
    }

    fn read_io(&self, addr: u16) -> u8 {
        match addr {
            0xFF00 => self.joypad.read(),
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg | IF_UNUSED_BITS,
            0xFF10..=0xFF26 | 0xFF30..=0xFF3F => self.sound.read(addr),
            0xFF46 => self.oam_dma.page(),
            0xFF40..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6C => self.ppu.read_reg(addr),
            0xFF4D if self.cgb_mode => (self.key1 & 0x81) | 0x7E,
            0xFF51..=0xFF55 if self.cgb_mode => self.hdma.read(addr),
            0xFF70 if self.cgb_mode => 0xF8 | self.wram_bank as u8,
            _ => 0xFF,
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => self.ppu.write_vram(addr, val),
            0xC000..=0xFDFF => {
                let idx = self.wram_index(addr & 0xDFFF);
                self.wram[idx] = val;
            }
            0xFE00..=0xFE9F => {
                if !self.oam_dma.is_active() {
                    self.ppu.write_oam(addr, val);
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00..=0xFF7F => self.write_io(addr, val),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
        }
    }

    fn write_io(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF00 => self.joypad.write(val, &mut self.if_reg),
            0xFF01 | 0xFF02 => self.serial.write(addr, val),
            0xFF04..=0xFF07 => self.timer.write(addr, val, &mut self.if_reg),
            0xFF0F => self.if_reg = val & INTERRUPT_MASK,
            0xFF10..=0xFF26 | 0xFF30..=0xFF3F => self.sound.write(addr, val),
            0xFF46 => self.oam_dma.start(val),
            0xFF40..=0xFF4B | 0xFF4F | 0xFF68..=0xFF6C => {
                self.ppu.write_reg(addr, val, &mut self.if_reg)
            }
            0xFF4D if self.cgb_mode => self.key1 = (self.key1 & 0x80) | (val & 0x01),
            0xFF51..=0xFF55 if self.cgb_mode => match self.hdma.write(addr, val) {
                HdmaRequest::None => {}
                HdmaRequest::General { blocks } => self.run_gdma(blocks),
                HdmaRequest::HBlankArmed => {
                    // Armed during HBlank: the first block goes right away.
                    if self.ppu.lcd_enabled() && self.ppu.in_hblank() {
                        self.run_hdma_block();
                    }
                }
            },
            0xFF70 if self.cgb_mode => {
                let bank = (val & 0x07) as usize;
                self.wram_bank = bank.max(1);
            }
            _ => {}
        }
    }

    fn block_stall(&self) -> u32 {
        if self.double_speed() {
            HDMA_BLOCK_STALL_DOUBLE
        } else {
            HDMA_BLOCK_STALL
        }
    }

    fn copy_vram_block(&mut self) {
        for _ in 0..HDMA_BLOCK_LEN {
            let (src, dst) = self.hdma.next_byte();
            let val = self.dma_read(src);
            self.ppu.write_vram_dma(dst, val);
        }
    }

    fn run_gdma(&mut self, blocks: u8) {
        for _ in 0..blocks {
            self.copy_vram_block();
        }
        self.gdma_stall += blocks as u32 * self.block_stall();
    }

    fn run_hdma_block(&mut self) {
        self.copy_vram_block();
        self.hdma.finish_block();
        self.gdma_stall += self.block_stall();
        if !self.hdma.is_active() {
            debug!("HDMA complete");
        }
    }
}

impl std::fmt::Debug for Mmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmu")
            .field("wram_bank", &self.wram_bank)
            .field("if_reg", &self.if_reg)
            .field("ie_reg", &self.ie_reg)
            .field("key1", &self.key1)
            .field("gdma_stall", &self.gdma_stall)
            .finish_non_exhaustive()
    }
}
