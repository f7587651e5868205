//! Sound register file (NR10-NR52 and wave RAM) and the output sample clock.
//!
//! Channel synthesis is left to the host. The registers read back exactly
//! as the hardware masks them, NR52 gates the whole block, and a fixed-rate
//! clock hands the attached [`AudioSink`] one idle-level sample pair per
//! output period while sound is powered.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::interfaces::{AudioSink, NullAudio};

/// Dots per second, identical in both speed modes.
const DOTS_PER_SECOND: u64 = 4_194_304;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

const REG_COUNT: usize = 0x17; // FF10..=FF26
const WAVE_RAM_SIZE: usize = 0x10;

/// Register contents after the boot ROM, FF10..=FF25.
const BOOT_REGS: [u8; 0x16] = [
    0x80, 0xBF, 0xF3, 0xFF, 0xBF, // NR10-NR14
    0xFF, 0x3F, 0x00, 0xFF, 0xBF, // unused, NR21-NR24
    0x7F, 0xFF, 0x9F, 0xFF, 0xBF, // NR30-NR34
    0xFF, 0xFF, 0x00, 0x00, 0xBF, // unused, NR41-NR44
    0x77, 0xF3, // NR50, NR51
];

fn default_sink() -> Box<dyn AudioSink> {
    Box::new(NullAudio)
}

#[derive(Serialize, Deserialize)]
pub struct Sound {
    regs: Vec<u8>,
    wave_ram: Vec<u8>,
    powered: bool,
    /// NR52 bits 0-3: channels triggered and not yet silenced.
    channels_on: u8,
    sample_rate: u32,
    /// Dots accumulated toward the next output sample, scaled by the
    /// sample rate so no rounding error builds up.
    sample_clock: u64,
    #[serde(skip, default = "default_sink")]
    sink: Box<dyn AudioSink>,
}

impl Sound {
    pub fn new(sample_rate: u32) -> Self {
        let mut regs = vec![0; REG_COUNT];
        regs[..BOOT_REGS.len()].copy_from_slice(&BOOT_REGS);
        Self {
            regs,
            wave_ram: vec![0; WAVE_RAM_SIZE],
            powered: true,
            channels_on: 0x01,
            sample_rate: sample_rate.max(1),
            sample_clock: 0,
            sink: default_sink(),
        }
    }

    /// Attach a sink. It receives `start` right away if sound is powered.
    pub fn connect(&mut self, mut sink: Box<dyn AudioSink>) {
        if self.powered {
            sink.start();
        }
        self.sink = sink;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 => 0x3F,
            0xFF12 => 0x00,
            0xFF13 => 0xFF,
            0xFF14 => 0xBF,
            0xFF16 => 0x3F,
            0xFF17 => 0x00,
            0xFF18 => 0xFF,
            0xFF19 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1B => 0xFF,
            0xFF1C => 0x9F,
            0xFF1D => 0xFF,
            0xFF1E => 0xBF,
            0xFF20 => 0xFF,
            0xFF21 => 0x00,
            0xFF22 => 0x00,
            0xFF23 => 0xBF,
            0xFF24 => 0x00,
            0xFF25 => 0x00,
            0xFF26 => 0x70,
            0xFF15 | 0xFF1F => 0xFF,
            0xFF30..=0xFF3F => 0x00,
            _ => 0xFF,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF26 => {
                let power = if self.powered { 0x80 } else { 0 };
                power | self.channels_on | Self::read_mask(addr)
            }
            0xFF10..=0xFF25 => self.regs[(addr - 0xFF10) as usize] | Self::read_mask(addr),
            0xFF30..=0xFF3F => self.wave_ram[(addr - 0xFF30) as usize],
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF26 => self.set_power(val & 0x80 != 0),
            // Wave RAM stays writable with the power off.
            0xFF30..=0xFF3F => self.wave_ram[(addr - 0xFF30) as usize] = val,
            0xFF10..=0xFF25 if self.powered => {
                self.regs[(addr - 0xFF10) as usize] = val;
                self.track_channel(addr, val);
            }
            _ => {}
        }
    }

    /// Triggers switch a channel on; clearing its DAC switches it off.
    fn track_channel(&mut self, addr: u16, val: u8) {
        let (channel, dac_on) = match addr {
            0xFF12 => (0, val & 0xF8 != 0),
            0xFF17 => (1, val & 0xF8 != 0),
            0xFF1A => (2, val & 0x80 != 0),
            0xFF21 => (3, val & 0xF8 != 0),
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => {
                let channel = match addr {
                    0xFF14 => 0,
                    0xFF19 => 1,
                    0xFF1E => 2,
                    _ => 3,
                };
                if val & 0x80 != 0 && self.dac_enabled(channel) {
                    self.channels_on |= 1 << channel;
                }
                return;
            }
            _ => return,
        };
        if !dac_on {
            self.channels_on &= !(1 << channel);
        }
    }

    fn dac_enabled(&self, channel: u8) -> bool {
        let reg = |addr: u16| self.regs[(addr - 0xFF10) as usize];
        match channel {
            0 => reg(0xFF12) & 0xF8 != 0,
            1 => reg(0xFF17) & 0xF8 != 0,
            2 => reg(0xFF1A) & 0x80 != 0,
            _ => reg(0xFF21) & 0xF8 != 0,
        }
    }

    fn set_power(&mut self, on: bool) {
        if on == self.powered {
            return;
        }
        self.powered = on;
        if on {
            debug!("sound powered on");
            self.sink.start();
        } else {
            debug!("sound powered off");
            self.regs[..0x16].fill(0);
            self.channels_on = 0;
            self.sink.stop();
        }
    }

    /// Advance the output clock by `dots`.
    pub fn step(&mut self, dots: u16) {
        self.sample_clock += dots as u64 * self.sample_rate as u64;
        while self.sample_clock >= DOTS_PER_SECOND {
            self.sample_clock -= DOTS_PER_SECOND;
            if self.powered {
                self.sink.play(0.0, 0.0);
            }
        }
    }

    /// Replace register state, keeping the attached sink.
    pub fn restore(&mut self, other: Sound) {
        let sink = std::mem::replace(&mut self.sink, default_sink());
        *self = other;
        self.sink = sink;
    }
}

impl std::fmt::Debug for Sound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sound")
            .field("powered", &self.powered)
            .field("channels_on", &self.channels_on)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counts {
        starts: usize,
        stops: usize,
        samples: usize,
    }

    struct Recorder(Arc<Mutex<Counts>>);

    impl AudioSink for Recorder {
        fn start(&mut self) {
            self.0.lock().unwrap().starts += 1;
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
        fn play(&mut self, left: f32, right: f32) {
            assert_eq!((left, right), (0.0, 0.0));
            self.0.lock().unwrap().samples += 1;
        }
    }

    #[test]
    fn boot_state_reads_back_through_masks() {
        let sound = Sound::new(DEFAULT_SAMPLE_RATE);
        assert_eq!(sound.read(0xFF26), 0xF1);
        assert_eq!(sound.read(0xFF11), 0xBF);
        assert_eq!(sound.read(0xFF13), 0xFF);
        assert_eq!(sound.read(0xFF24), 0x77);
    }

    #[test]
    fn power_off_clears_and_locks_registers() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let mut sound = Sound::new(DEFAULT_SAMPLE_RATE);
        sound.connect(Box::new(Recorder(counts.clone())));
        sound.write(0xFF26, 0x00);
        assert_eq!(sound.read(0xFF26), 0x70);
        assert_eq!(sound.read(0xFF24), 0x00);
        sound.write(0xFF24, 0x55);
        assert_eq!(sound.read(0xFF24), 0x00);
        sound.write(0xFF30, 0xAB);
        assert_eq!(sound.read(0xFF30), 0xAB);
        sound.write(0xFF26, 0x80);
        let c = counts.lock().unwrap();
        assert_eq!((c.starts, c.stops), (2, 1));
    }

    #[test]
    fn emits_samples_at_the_configured_rate() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let mut sound = Sound::new(32_768);
        sound.connect(Box::new(Recorder(counts.clone())));
        // One second of dots in machine-cycle steps.
        for _ in 0..DOTS_PER_SECOND / 4 {
            sound.step(4);
        }
        assert_eq!(counts.lock().unwrap().samples, 32_768);
    }
}
