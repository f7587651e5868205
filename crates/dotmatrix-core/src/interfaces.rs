//! Traits the host implements to receive video, audio and serial output and
//! to persist battery-backed cartridge data.
//!
//! Every trait has a do-nothing implementation so a [`crate::gameboy::GameBoy`]
//! can run headless without any of them attached.

use std::io;

use crate::cartridge::CartridgeId;

/// Receives stereo samples at the configured sample rate.
pub trait AudioSink: Send {
    /// Sound was powered on (NR52 bit 7 set).
    fn start(&mut self);
    /// Sound was powered off.
    fn stop(&mut self);
    fn play(&mut self, left: f32, right: f32);
}

/// Receives each completed frame.
pub trait VideoSink: Send {
    /// `pixels` holds `SCREEN_HEIGHT` rows of 0x00RRGGBB values, `pitch`
    /// pixels apart.
    fn draw(&mut self, pixels: &[u32], pitch: usize);
}

/// The other end of the link cable.
pub trait SerialLink: Send {
    /// Called once per completed transfer with the byte shifted out.
    fn send_data(&mut self, byte: u8);

    /// Byte shifted in during the next transfer. An unconnected port reads
    /// all ones.
    fn receive_data(&mut self) -> u8 {
        0xFF
    }
}

/// Battery RAM and RTC storage keyed by cartridge identity.
pub trait SaveStore: Send {
    fn load_ram(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>>;
    fn save_ram(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()>;
    fn load_rtc(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>>;
    fn save_rtc(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudio;

impl AudioSink for NullAudio {
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn play(&mut self, _left: f32, _right: f32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullVideo;

impl VideoSink for NullVideo {
    fn draw(&mut self, _pixels: &[u32], _pitch: usize) {}
}

/// A port with no cable attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLink;

impl SerialLink for NullLink {
    fn send_data(&mut self, _byte: u8) {}
}

/// Echoes every sent byte back as the next received byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackLink {
    last: Option<u8>,
}

impl SerialLink for LoopbackLink {
    fn send_data(&mut self, byte: u8) {
        self.last = Some(byte);
    }

    fn receive_data(&mut self) -> u8 {
        self.last.take().unwrap_or(0xFF)
    }
}

/// Keeps saves in memory only; nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemorySaveStore {
    ram: std::collections::HashMap<String, Vec<u8>>,
    rtc: std::collections::HashMap<String, Vec<u8>>,
}

impl SaveStore for MemorySaveStore {
    fn load_ram(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>> {
        Ok(self.ram.get(&id.key()).cloned())
    }

    fn save_ram(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()> {
        self.ram.insert(id.key(), data.to_vec());
        Ok(())
    }

    fn load_rtc(&mut self, id: &CartridgeId) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rtc.get(&id.key()).cloned())
    }

    fn save_rtc(&mut self, id: &CartridgeId, data: &[u8]) -> io::Result<()> {
        self.rtc.insert(id.key(), data.to_vec());
        Ok(())
    }
}
