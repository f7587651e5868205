use std::{
    fmt, io,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ROM_BANK_SIZE: usize = 0x4000;
const RAM_BANK_SIZE: usize = 0x2000;
const HEADER_END: usize = 0x150;

/// Dots per second; the RTC is clocked from the same 4 MiHz reference as the PPU.
const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

const RTC_FILE_MAGIC: &[u8; 4] = b"RTC1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("unsupported cartridge type {0:02X}")]
    UnsupportedType(u8),
    #[error("ROM image is {0} bytes, shorter than the 0x150-byte header")]
    TruncatedHeader(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MbcKind {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

/// Title and checksums, used to key battery saves and to match snapshots
/// against the loaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartridgeId {
    pub title: String,
    pub header_checksum: u8,
    pub global_checksum: u16,
}

impl CartridgeId {
    /// Filesystem-safe key, e.g. `POKEMON_RED-20-91E6`.
    pub fn key(&self) -> String {
        let title: String = self
            .title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let title = if title.is_empty() { "UNTITLED".into() } else { title };
        format!(
            "{title}-{:02X}-{:04X}",
            self.header_checksum, self.global_checksum
        )
    }
}

impl fmt::Display for CartridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Decoded controller registers, as seen by code outside the cartridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankRegisters {
    pub rom_bank: u16,
    pub ram_bank: u8,
    pub ram_enabled: bool,
    /// MBC1 banking mode; always 0 for other controllers.
    pub mode: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        rtc: Option<Mbc3Rtc>,
        latch_armed: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }

    fn read(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.seconds & 0x3F,
            0x09 => self.minutes & 0x3F,
            0x0A => self.hours & 0x1F,
            0x0B => (self.days & 0x00FF) as u8,
            0x0C => self.control_byte(),
            _ => 0xFF,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Mbc3Rtc {
    regs: RtcRegisters,
    snapshot: RtcRegisters,
    /// While set, register reads come from `snapshot` instead of the live clock.
    latched: bool,
    /// Wall-clock seconds at the last persist/restore.
    last_update: u64,
    subsecond_cycles: u32,
}

impl Mbc3Rtc {
    fn new(now: SystemTime) -> Self {
        Self {
            regs: RtcRegisters::default(),
            snapshot: RtcRegisters::default(),
            latched: false,
            last_update: unix_secs(now),
            subsecond_cycles: 0,
        }
    }

    fn latch(&mut self) {
        self.snapshot = self.regs;
        self.latched = true;
    }

    fn unlatch(&mut self) {
        self.latched = false;
    }

    fn read(&self, reg: u8) -> u8 {
        if self.latched {
            self.snapshot.read(reg)
        } else {
            self.regs.read(reg)
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
    }

    fn step(&mut self, cycles: u64) {
        if self.regs.halt {
            return;
        }
        self.add_cycles(cycles);
    }

    /// Catch up with wall-clock time that passed while the host was closed.
    fn sync_wall(&mut self, now: SystemTime) {
        let now_secs = unix_secs(now);
        let elapsed = now_secs.saturating_sub(self.last_update);
        self.last_update = now_secs;
        if self.regs.halt || elapsed == 0 {
            return;
        }
        self.advance_seconds(elapsed);
    }

    fn add_cycles(&mut self, cycles: u64) {
        let mut seconds = cycles / RTC_CYCLES_PER_SECOND as u64;
        let rem = (cycles % RTC_CYCLES_PER_SECOND as u64) as u32;

        let mut sub = self.subsecond_cycles + rem;
        if sub >= RTC_CYCLES_PER_SECOND {
            sub -= RTC_CYCLES_PER_SECOND;
            seconds += 1;
        }
        self.subsecond_cycles = sub;

        if seconds > 0 {
            self.advance_seconds(seconds);
        }
    }

    fn advance_seconds(&mut self, seconds: u64) {
        let r = &mut self.regs;
        let minutes = count_up(&mut r.seconds, seconds, 60, 6);
        let hours = count_up(&mut r.minutes, minutes, 60, 6);
        let days = count_up(&mut r.hours, hours, 24, 5);
        let total = r.days as u64 + days;
        if total > 0x01FF {
            r.carry = true;
        }
        r.days = (total & 0x01FF) as u16;
    }

    /// `RTC1` followed by a MessagePack [`RtcImage`].
    fn to_rtc_bytes(&self, now: SystemTime) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let image = RtcImage {
            saved_at: unix_secs(now),
            subsecond_cycles: self.subsecond_cycles,
            regs: self.regs,
        };
        let mut data = RTC_FILE_MAGIC.to_vec();
        rmp_serde::encode::write(&mut data, &image)?;
        Ok(data)
    }

    fn load_rtc_bytes(&mut self, data: &[u8]) -> bool {
        let Some(body) = data.strip_prefix(RTC_FILE_MAGIC.as_slice()) else {
            return false;
        };
        let Ok(image) = rmp_serde::from_slice::<RtcImage>(body) else {
            return false;
        };
        let regs = image.regs;
        self.regs = RtcRegisters {
            seconds: regs.seconds & 0x3F,
            minutes: regs.minutes & 0x3F,
            hours: regs.hours & 0x1F,
            days: regs.days & 0x01FF,
            ..regs
        };
        self.last_update = image.saved_at;
        self.subsecond_cycles = image.subsecond_cycles.min(RTC_CYCLES_PER_SECOND - 1);
        self.snapshot = self.regs;
        self.latched = false;
        true
    }
}

/// Clock state as written to the host's `.rtc` file.
#[derive(Serialize, Deserialize)]
struct RtcImage {
    /// Unix seconds when the image was written.
    saved_at: u64,
    subsecond_cycles: u32,
    regs: RtcRegisters,
}

/// Count `field` forward `steps` times in a `width`-bit register that rolls
/// over at `modulus`, returning the carries into the next field. A value
/// software left out of range counts up to the top of the register and
/// wraps to 0 without carrying.
fn count_up(field: &mut u8, steps: u64, modulus: u64, width: u32) -> u64 {
    let value = *field as u64;
    let (start, steps) = if value < modulus {
        (value, steps)
    } else {
        let to_wrap = (1u64 << width) - value;
        if steps < to_wrap {
            *field = (value + steps) as u8;
            return 0;
        }
        (0, steps - to_wrap)
    };
    let total = start + steps;
    *field = (total % modulus) as u8;
    total / modulus
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Mutable cartridge state captured by snapshots. The ROM itself is not
/// part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeState {
    ram: Vec<u8>,
    mbc: MbcState,
}

#[derive(Debug)]
pub struct Cartridge {
    rom: Vec<u8>,
    ram: Vec<u8>,
    pub kind: MbcKind,
    pub cgb: bool,
    pub title: String,
    cart_type: u8,
    header_checksum: u8,
    global_checksum: u16,
    mbc_state: MbcState,
    ram_dirty: bool,
}

impl Cartridge {
    /// Parse the header and build the matching controller.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_END {
            return Err(CartridgeError::TruncatedHeader(data.len()));
        }
        let header = Header::parse(&data);
        let cart_type = header.cart_type();
        let kind = header.mbc_kind()?;
        let ram_size = header.ram_size();

        let expected_rom = header.rom_size();
        if data.len() < expected_rom {
            warn!(
                "ROM image is {} bytes but header declares {}",
                data.len(),
                expected_rom
            );
        }

        let mbc_state = match kind {
            MbcKind::NoMbc => MbcState::NoMbc,
            MbcKind::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
            },
            MbcKind::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcKind::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                rtc: has_rtc(cart_type).then(|| Mbc3Rtc::new(SystemTime::now())),
                latch_armed: false,
            },
            MbcKind::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
        };

        let cart = Self {
            title: header.title(),
            cgb: header.cgb_supported(),
            header_checksum: header.header_checksum(),
            global_checksum: header.global_checksum(),
            rom: data,
            ram: vec![0; ram_size],
            kind,
            cart_type,
            mbc_state,
            ram_dirty: false,
        };
        info!(
            "Loaded ROM: {} (MBC: {:?}, CGB: {})",
            cart.title,
            cart.kind,
            if cart.cgb { "yes" } else { "no" }
        );
        Ok(cart)
    }

    pub fn identity(&self) -> CartridgeId {
        CartridgeId {
            title: self.title.clone(),
            header_checksum: self.header_checksum,
            global_checksum: self.global_checksum,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match (&self.mbc_state, addr) {
            (MbcState::NoMbc, 0x0000..=0x7FFF) => self.rom_byte(0, addr as usize),
            (MbcState::Mbc1 { ram_bank, mode, .. }, 0x0000..=0x3FFF) => {
                let bank = if *mode == 0 {
                    0
                } else {
                    ((*ram_bank as usize) & 0x03) << 5
                };
                self.rom_byte(bank, addr as usize)
            }
            (
                MbcState::Mbc1 {
                    rom_bank, ram_bank, ..
                },
                0x4000..=0x7FFF,
            ) => {
                let bank = (((*ram_bank as usize) & 0x03) << 5) | (*rom_bank as usize & 0x1F);
                self.rom_byte(bank, addr as usize - 0x4000)
            }
            (MbcState::Mbc2 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte((*rom_bank & 0x0F).max(1) as usize, addr as usize - 0x4000)
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte((*rom_bank).max(1) as usize, addr as usize - 0x4000)
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte(*rom_bank as usize, addr as usize - 0x4000)
            }
            (_, 0x0000..=0x3FFF) => self.rom_byte(0, addr as usize),
            (MbcState::NoMbc, 0xA000..=0xBFFF) => self.ram_byte(addr as usize - 0xA000),
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable || self.ram.is_empty() {
                    return 0xFF;
                }
                // 512 half-bytes mirrored across the whole window.
                let idx = (addr as usize - 0xA000) & 0x01FF;
                0xF0 | (self.ram[idx] & 0x0F)
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF)
            | (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if !*ram_enable {
                    return 0xFF;
                }
                self.ram_byte(self.ram_index(addr))
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    return 0xFF;
                }
                match *ram_bank {
                    0x00..=0x03 => self.ram_byte(self.ram_index(addr)),
                    0x08..=0x0C => rtc.as_ref().map_or(0xFF, |r| r.read(*ram_bank)),
                    _ => 0xFF,
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        let battery = self.has_battery();
        let ram_index = self.ram_index(addr);
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                if let Some(b) = self.ram.get_mut(addr as usize - 0xA000) {
                    *b = val;
                }
            }
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // Address bit 8 picks the register: clear for RAM enable,
                // set for ROM bank.
                if addr & 0x0100 == 0 {
                    let enable = val & 0x0F == 0x0A;
                    if *ram_enable && !enable && battery {
                        self.ram_dirty = true;
                    }
                    *ram_enable = enable;
                } else {
                    *rom_bank = (val & 0x0F).max(1);
                }
            }
            (MbcState::Mbc2 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable && let Some(b) = self.ram.get_mut((addr as usize - 0xA000) & 0x01FF)
                {
                    *b = val & 0x0F;
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF)
            | (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                let enable = val & 0x0F == 0x0A;
                if *ram_enable && !enable && battery {
                    self.ram_dirty = true;
                }
                *ram_enable = enable;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = (val & 0x1F).max(1);
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = (val & 0x7F).max(1);
            }
            (MbcState::Mbc3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                // Anything outside the RAM banks and RTC registers is ignored.
                if matches!(val, 0x00..=0x03 | 0x08..=0x0C) {
                    *ram_bank = val;
                }
            }
            (
                MbcState::Mbc3 {
                    latch_armed, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => match val {
                0x00 => {
                    *latch_armed = true;
                    if let Some(rtc) = rtc {
                        rtc.unlatch();
                    }
                }
                0x01 if *latch_armed => {
                    *latch_armed = false;
                    if let Some(rtc) = rtc {
                        rtc.latch();
                        debug!("RTC latched");
                    }
                }
                _ => *latch_armed = false,
            },
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                if val <= 0x0F {
                    *ram_bank = val;
                }
            }
            (MbcState::Mbc1 { ram_enable, .. }, 0xA000..=0xBFFF)
            | (MbcState::Mbc5 { ram_enable, .. }, 0xA000..=0xBFFF) => {
                if *ram_enable && let Some(b) = self.ram.get_mut(ram_index) {
                    *b = val;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    rtc,
                    ..
                },
                0xA000..=0xBFFF,
            ) => {
                if !*ram_enable {
                    return;
                }
                match *ram_bank {
                    0x00..=0x03 => {
                        if let Some(b) = self.ram.get_mut(ram_index) {
                            *b = val;
                        }
                    }
                    0x08..=0x0C => {
                        if let Some(rtc) = rtc.as_mut() {
                            rtc.write_register(*ram_bank, val);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    pub fn bank_registers(&self) -> BankRegisters {
        match &self.mbc_state {
            MbcState::NoMbc => BankRegisters {
                rom_bank: 1,
                ram_bank: 0,
                ram_enabled: !self.ram.is_empty(),
                mode: 0,
            },
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
            } => BankRegisters {
                rom_bank: ((*ram_bank as u16 & 0x03) << 5) | *rom_bank as u16,
                ram_bank: *ram_bank,
                ram_enabled: *ram_enable,
                mode: *mode,
            },
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => BankRegisters {
                rom_bank: *rom_bank as u16,
                ram_bank: 0,
                ram_enabled: *ram_enable,
                mode: 0,
            },
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                ..
            } => BankRegisters {
                rom_bank: *rom_bank as u16,
                ram_bank: *ram_bank,
                ram_enabled: *ram_enable,
                mode: 0,
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => BankRegisters {
                rom_bank: *rom_bank,
                ram_bank: *ram_bank,
                ram_enabled: *ram_enable,
                mode: 0,
            },
        }
    }

    /// Advance the real-time clock by `dots` reference-clock ticks.
    pub fn step_rtc(&mut self, dots: u32) {
        if let Some(rtc) = self.rtc_mut() {
            rtc.step(dots as u64);
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    pub fn has_rtc(&self) -> bool {
        has_rtc(self.cart_type)
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// Replace external RAM contents from a battery save. Extra bytes are
    /// dropped and a short image leaves the tail untouched.
    pub fn load_ram(&mut self, bytes: &[u8]) {
        if bytes.len() != self.ram.len() {
            warn!(
                "save RAM is {} bytes, cartridge has {}",
                bytes.len(),
                self.ram.len()
            );
        }
        for (d, s) in self.ram.iter_mut().zip(bytes) {
            *d = *s;
        }
    }

    /// Serialized clock state stamped with `now`, or `None` without an RTC.
    pub fn rtc_bytes(&mut self, now: SystemTime) -> io::Result<Option<Vec<u8>>> {
        let Some(rtc) = self.rtc_mut() else {
            return Ok(None);
        };
        rtc.last_update = unix_secs(now);
        rtc.to_rtc_bytes(now).map(Some).map_err(io::Error::other)
    }

    /// Restore clock state and catch up with the wall time elapsed since it
    /// was written. Returns false if the bytes are not a valid RTC image.
    pub fn load_rtc(&mut self, bytes: &[u8], now: SystemTime) -> bool {
        let Some(rtc) = self.rtc_mut() else {
            return false;
        };
        if !rtc.load_rtc_bytes(bytes) {
            warn!("ignoring malformed RTC data ({} bytes)", bytes.len());
            return false;
        }
        rtc.sync_wall(now);
        true
    }

    /// True once since the last call if a battery cartridge disabled its RAM.
    pub fn take_ram_dirty(&mut self) -> bool {
        std::mem::take(&mut self.ram_dirty)
    }

    pub fn save_state(&self) -> CartridgeState {
        CartridgeState {
            ram: self.ram.clone(),
            mbc: self.mbc_state.clone(),
        }
    }

    pub fn load_state(&mut self, state: CartridgeState) {
        if state.ram.len() != self.ram.len() {
            warn!(
                "snapshot RAM is {} bytes, cartridge has {}",
                state.ram.len(),
                self.ram.len()
            );
        }
        self.ram = state.ram;
        self.mbc_state = state.mbc;
    }

    fn rom_byte(&self, bank: usize, offset: usize) -> u8 {
        let bank_count = (self.rom.len() / ROM_BANK_SIZE).max(1);
        let idx = (bank % bank_count) * ROM_BANK_SIZE + offset;
        self.rom.get(idx).copied().unwrap_or(0xFF)
    }

    fn ram_byte(&self, idx: usize) -> u8 {
        self.ram.get(idx).copied().unwrap_or(0xFF)
    }

    /// Offset into `ram` for a 0xA000-0xBFFF address under the current banking.
    fn ram_index(&self, addr: u16) -> usize {
        let offset = (addr as usize).wrapping_sub(0xA000) & (RAM_BANK_SIZE - 1);
        let bank_count = self.ram.len().div_ceil(RAM_BANK_SIZE).max(1);
        let bank = match &self.mbc_state {
            MbcState::Mbc1 { ram_bank, mode, .. } if *mode == 1 => *ram_bank as usize,
            MbcState::Mbc3 { ram_bank, .. } => (*ram_bank & 0x03) as usize,
            MbcState::Mbc5 { ram_bank, .. } => *ram_bank as usize,
            _ => 0,
        };
        // Small RAMs (2 KiB) mirror inside their single bank.
        let idx = (bank % bank_count) * RAM_BANK_SIZE + offset;
        if self.ram.is_empty() {
            idx
        } else {
            idx % self.ram.len()
        }
    }

    fn rtc_mut(&mut self) -> Option<&mut Mbc3Rtc> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc: Some(rtc), .. } => Some(rtc),
            _ => None,
        }
    }
}

fn has_rtc(cart_type: u8) -> bool {
    matches!(cart_type, 0x0F | 0x10)
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn title(&self) -> String {
        let mut slice = &self.data[0x0134..0x0143];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cgb_supported(&self) -> bool {
        self.data[0x0143] & 0x80 != 0
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn mbc_kind(&self) -> Result<MbcKind, CartridgeError> {
        match self.cart_type() {
            0x00 | 0x08 | 0x09 => Ok(MbcKind::NoMbc),
            0x01..=0x03 => Ok(MbcKind::Mbc1),
            0x05 | 0x06 => Ok(MbcKind::Mbc2),
            0x0F..=0x13 => Ok(MbcKind::Mbc3),
            0x19..=0x1E => Ok(MbcKind::Mbc5),
            other => Err(CartridgeError::UnsupportedType(other)),
        }
    }

    fn rom_size(&self) -> usize {
        match self.data[0x0148] {
            code @ 0x00..=0x08 => 0x8000 << code,
            _ => 0,
        }
    }

    fn ram_size(&self) -> usize {
        // MBC2 carries 512x4 bits internally whatever the header says.
        if matches!(self.cart_type(), 0x05 | 0x06) {
            return 0x200;
        }
        match self.data[0x0149] {
            0x01 => 0x800,
            0x02 => 0x2000,
            0x03 => 0x8000,
            0x04 => 0x20000,
            0x05 => 0x10000,
            _ => 0,
        }
    }

    fn header_checksum(&self) -> u8 {
        self.data[0x014D]
    }

    fn global_checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[0x014E], self.data[0x014F]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_ticks_through_invalid_values() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 60;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 61);

        rtc.regs.seconds = 63;
        rtc.regs.minutes = 5;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 5);
    }

    #[test]
    fn rtc_catches_up_days_in_one_jump() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.advance_seconds(3 * 86_400 + 2 * 3_600 + 3 * 60 + 4);
        assert_eq!(
            (rtc.regs.days, rtc.regs.hours, rtc.regs.minutes, rtc.regs.seconds),
            (3, 2, 3, 4)
        );
        assert!(!rtc.regs.carry);

        // Hour 30 runs up to 31 and wraps without adding a day.
        rtc.regs.hours = 30;
        rtc.advance_seconds(3_600);
        assert_eq!(rtc.regs.hours, 31);
        rtc.advance_seconds(2 * 3_600);
        assert_eq!((rtc.regs.days, rtc.regs.hours), (3, 1));
    }

    #[test]
    fn rtc_day_overflow_sets_carry() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 23;
        rtc.regs.days = 0x01FF;

        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.days, 0);
        assert!(rtc.regs.carry);
        assert_eq!(rtc.regs.read(0x0C) & 0x81, 0x80);
    }

    #[test]
    fn rtc_halt_stops_the_clock() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.write_register(0x0C, 0x40);
        rtc.step(RTC_CYCLES_PER_SECOND as u64 * 3);
        assert_eq!(rtc.regs.seconds, 0);

        rtc.write_register(0x0C, 0x00);
        rtc.step(RTC_CYCLES_PER_SECOND as u64 * 3);
        assert_eq!(rtc.regs.seconds, 3);
    }

    #[test]
    fn rtc_file_image_restores_registers_and_catches_up() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.regs.minutes = 10;
        rtc.regs.days = 0x100;
        let saved_at = UNIX_EPOCH + Duration::from_secs(1_000);
        let bytes = rtc.to_rtc_bytes(saved_at).unwrap();
        assert_eq!(&bytes[..4], RTC_FILE_MAGIC);

        let mut restored = Mbc3Rtc::new(UNIX_EPOCH);
        assert!(restored.load_rtc_bytes(&bytes));
        assert_eq!(restored.regs.minutes, 10);
        assert_eq!(restored.regs.days, 0x100);

        restored.sync_wall(saved_at + Duration::from_secs(65));
        assert_eq!(restored.regs.minutes, 11);
        assert_eq!(restored.regs.seconds, 5);
    }

    #[test]
    fn rtc_rejects_foreign_bytes() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        assert!(!rtc.load_rtc_bytes(b"RTC2not-a-clock-image-at-all"));
        assert!(!rtc.load_rtc_bytes(b"RTC1\xC1"));
        assert!(!rtc.load_rtc_bytes(&[]));
    }

    #[test]
    fn identity_key_is_filesystem_safe() {
        let id = CartridgeId {
            title: "MY GAME/2".into(),
            header_checksum: 0x3C,
            global_checksum: 0xBEEF,
        };
        assert_eq!(id.key(), "MY_GAME_2-3C-BEEF");
    }
}
