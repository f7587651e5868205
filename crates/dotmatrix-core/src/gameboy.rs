use std::{io, time::SystemTime};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    cartridge::{Cartridge, CartridgeError},
    cpu::Cpu,
    input::Button,
    interfaces::{AudioSink, NullVideo, SaveStore, SerialLink, VideoSink},
    mmu::Mmu,
    ppu::{DOTS_PER_LINE, SCREEN_WIDTH},
    snapshot::{self, SnapshotError},
    sound::DEFAULT_SAMPLE_RATE,
};

/// 154 lines of 456 dots.
pub const DOTS_PER_FRAME: u32 = DOTS_PER_LINE as u32 * 154;

/// Which hardware to emulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// CGB when the cartridge header (0x143) advertises colour support.
    #[default]
    Auto,
    Dmg,
    Cgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub mode: HardwareMode,
    pub sample_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Auto,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// The whole machine. Owns the CPU and the bus; every other subsystem lives
/// inside [`Mmu`] and is reached through it.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub cgb: bool,
    sample_rate: u32,
    video: Box<dyn VideoSink>,
    save_store: Option<Box<dyn SaveStore>>,
    paused: bool,
}

impl GameBoy {
    pub fn new(config: Config, cart: Option<Cartridge>) -> Self {
        let cgb = match config.mode {
            HardwareMode::Auto => cart.as_ref().is_some_and(|c| c.cgb),
            HardwareMode::Dmg => false,
            HardwareMode::Cgb => true,
        };
        let mut mmu = Mmu::new(cgb, config.sample_rate);
        if let Some(cart) = cart {
            mmu.load_cart(cart);
        }
        info!("starting in {} mode", if cgb { "CGB" } else { "DMG" });
        Self {
            cpu: Cpu::new(cgb),
            mmu,
            cgb,
            sample_rate: config.sample_rate,
            video: Box::new(NullVideo),
            save_store: None,
            paused: false,
        }
    }

    /// Parse `rom` and build a machine around it.
    pub fn from_rom(config: Config, rom: Vec<u8>) -> Result<Self, CartridgeError> {
        let cart = Cartridge::from_bytes(rom)?;
        Ok(Self::new(config, Some(cart)))
    }

    /// Return to the post-boot state, keeping the cartridge and every
    /// attached collaborator.
    pub fn reset(&mut self) {
        let old = std::mem::replace(&mut self.mmu, Mmu::new(self.cgb, self.sample_rate));
        let fresh_serial = std::mem::replace(&mut self.mmu.serial, old.serial);
        self.mmu.serial.restore(fresh_serial);
        let fresh_sound = std::mem::replace(&mut self.mmu.sound, old.sound);
        self.mmu.sound.restore(fresh_sound);
        if let Some(cart) = old.cart {
            self.mmu.load_cart(cart);
        }
        self.cpu = Cpu::new(self.cgb);
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.mmu.cart.as_ref()
    }

    pub fn set_video_sink(&mut self, sink: Box<dyn VideoSink>) {
        self.video = sink;
    }

    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.mmu.sound.connect(sink);
    }

    pub fn set_serial_link(&mut self, link: Box<dyn SerialLink>) {
        self.mmu.serial.connect(link);
    }

    /// Attach battery storage and load any RAM or clock saved for the
    /// current cartridge.
    pub fn set_save_store(&mut self, mut store: Box<dyn SaveStore>) -> io::Result<()> {
        if let Some(cart) = self.mmu.cart.as_mut().filter(|c| c.has_battery()) {
            let id = cart.identity();
            if let Some(ram) = store.load_ram(&id)? {
                info!("loaded {} bytes of save RAM for {id}", ram.len());
                cart.load_ram(&ram);
            }
            if cart.has_rtc()
                && let Some(rtc) = store.load_rtc(&id)?
            {
                cart.load_rtc(&rtc, SystemTime::now());
            }
        }
        self.save_store = Some(store);
        Ok(())
    }

    /// Write battery RAM and clock through the attached store.
    pub fn flush_save(&mut self) -> io::Result<()> {
        let (Some(store), Some(cart)) = (self.save_store.as_mut(), self.mmu.cart.as_mut()) else {
            return Ok(());
        };
        if !cart.has_battery() {
            return Ok(());
        }
        let id = cart.identity();
        if !cart.ram().is_empty() {
            store.save_ram(&id, cart.ram())?;
        }
        if let Some(rtc) = cart.rtc_bytes(SystemTime::now())? {
            store.save_rtc(&id, &rtc)?;
        }
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.mmu
            .joypad
            .set_button(button, pressed, &mut self.mmu.if_reg);
    }

    /// Execute one instruction. Returns the machine cycles it took, or 0
    /// while paused.
    pub fn step(&mut self) -> u32 {
        if self.paused {
            return 0;
        }
        let before = self.cpu.cycles;
        self.cpu.step(&mut self.mmu);
        (self.cpu.cycles - before) as u32
    }

    /// Run until the PPU finishes a frame or one frame's worth of dots has
    /// elapsed (the LCD may be off). A finished frame goes to the video
    /// sink. Returns whether one was drawn.
    pub fn run_frame(&mut self) -> bool {
        if self.paused {
            return false;
        }
        let mut dots = 0u32;
        while !self.mmu.ppu.frame_ready() && dots < DOTS_PER_FRAME {
            let per_cycle = if self.mmu.double_speed() { 2 } else { 4 };
            dots += self.step() * per_cycle;
        }

        if self.mmu.cart.as_mut().is_some_and(|c| c.take_ram_dirty())
            && let Err(e) = self.flush_save()
        {
            warn!("failed to write save data: {e}");
        }

        if !self.mmu.ppu.frame_ready() {
            return false;
        }
        self.mmu.ppu.clear_frame_flag();
        self.video.draw(self.mmu.ppu.front_buffer(), SCREEN_WIDTH);
        true
    }

    /// The last completed frame, 0x00RRGGBB, row-major.
    pub fn frame(&self) -> &[u32] {
        self.mmu.ppu.front_buffer()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::save(&self.cpu, &self.mmu)
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        snapshot::restore(bytes, &mut self.cpu, &mut self.mmu)
    }
}

impl std::fmt::Debug for GameBoy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameBoy")
            .field("cpu", &self.cpu)
            .field("mmu", &self.mmu)
            .field("cgb", &self.cgb)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}
