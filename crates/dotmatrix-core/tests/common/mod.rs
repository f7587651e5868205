#![allow(dead_code)]

use dotmatrix_core::{Config, GameBoy, HardwareMode, cartridge::Cartridge};

pub const CODE_START: usize = 0x0150;

/// Synthetic cartridge image with a valid header. Entry at 0x100 jumps to
/// the code placed at 0x150.
pub struct RomBuilder {
    rom: Vec<u8>,
}

impl RomBuilder {
    pub fn new(cart_type: u8) -> Self {
        let mut rom = vec![0u8; 0x8000];
        // NOP; JP 0150
        rom[0x0100..0x0104].copy_from_slice(&[0x00, 0xC3, 0x50, 0x01]);
        rom[0x0134..0x0138].copy_from_slice(b"TEST");
        rom[0x0147] = cart_type;
        Self { rom }
    }

    /// Resize to `banks` 16 KiB banks, each tagged with its own number at
    /// offset 0x2000 of the bank.
    pub fn rom_banks(mut self, banks: usize) -> Self {
        self.rom.resize(banks * 0x4000, 0);
        self.rom[0x0148] = (banks / 2).max(1).trailing_zeros() as u8;
        for bank in 1..banks {
            self.rom[bank * 0x4000 + 0x2000] = bank as u8;
            self.rom[bank * 0x4000 + 0x2001] = (bank >> 8) as u8;
        }
        self
    }

    pub fn ram_size(mut self, code: u8) -> Self {
        self.rom[0x0149] = code;
        self
    }

    pub fn cgb(mut self) -> Self {
        self.rom[0x0143] = 0x80;
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.rom[0x0134..0x0143].fill(0);
        let bytes = &title.as_bytes()[..title.len().min(15)];
        self.rom[0x0134..0x0134 + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn code(self, code: &[u8]) -> Self {
        self.code_at(CODE_START, code)
    }

    pub fn code_at(mut self, addr: usize, code: &[u8]) -> Self {
        self.rom[addr..addr + code.len()].copy_from_slice(code);
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        let checksum = self.rom[0x0134..0x014D]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_sub(b).wrapping_sub(1));
        self.rom[0x014D] = checksum;
        self.rom
    }

    pub fn cartridge(self) -> Cartridge {
        Cartridge::from_bytes(self.build()).expect("valid test cartridge")
    }
}

pub fn dmg(rom: Vec<u8>) -> GameBoy {
    let config = Config {
        mode: HardwareMode::Dmg,
        ..Config::default()
    };
    GameBoy::from_rom(config, rom).expect("valid test ROM")
}

pub fn cgb(rom: Vec<u8>) -> GameBoy {
    let config = Config {
        mode: HardwareMode::Cgb,
        ..Config::default()
    };
    GameBoy::from_rom(config, rom).expect("valid test ROM")
}

/// Step until the CPU halts, giving up after `max_steps` instructions.
pub fn run_until_halt(gb: &mut GameBoy, max_steps: usize) {
    for _ in 0..max_steps {
        if gb.cpu.halted {
            return;
        }
        gb.step();
    }
    panic!("CPU did not halt within {max_steps} steps (PC={:04X})", gb.cpu.pc);
}

/// Advance the bus by `dots` PPU dots in single speed, without the CPU.
pub fn run_dots(gb: &mut GameBoy, dots: u32) {
    assert_eq!(dots % 4, 0);
    gb.mmu.tick(dots / 4);
}
