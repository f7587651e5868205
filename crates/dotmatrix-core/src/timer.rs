use serde::{Deserialize, Serialize};

use crate::interrupt::{self, Interrupt};

/// DIV value left behind by the boot ROM.
const BOOT_DIV: u16 = 0xABCC;

/// Ticks between TIMA overflowing to zero and the TMA reload (the reload
/// lands on the fourth tick after the overflow).
const RELOAD_DELAY: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    /// 16-bit internal divider counter. DIV register is the upper 8 bits.
    pub div: u16,
    /// Timer counter
    pub tima: u8,
    /// Timer modulo
    pub tma: u8,
    /// Timer control
    pub tac: u8,
    last_signal: bool,
    /// Reload pending after an overflow; TIMA reads 0 until it lands.
    pending_reload: bool,
    reload_delay: u8,
    /// Set during the tick in which the reload was applied.
    reloading: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            div: BOOT_DIV,
            tima: 0,
            tma: 0,
            tac: 0,
            last_signal: false,
            pending_reload: false,
            reload_delay: 0,
            reloading: false,
        }
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF04 => (self.div >> 8) as u8,
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            // Any write clears the whole divider; the value is ignored.
            0xFF04 => self.set_div(0, if_reg),
            0xFF05 => {
                if self.reloading {
                    // The reload wins over a write in the same tick.
                    return;
                }
                self.tima = val;
                // Writing inside the delay window cancels the reload and the
                // interrupt with it.
                self.pending_reload = false;
                self.reload_delay = 0;
            }
            0xFF06 => {
                self.tma = val;
                if self.reloading {
                    self.tima = val;
                }
            }
            0xFF07 => {
                let prev = Self::signal_with(self.div, self.tac);
                self.tac = val & 0x07;
                let new = Self::signal_with(self.div, self.tac);
                if prev && !new {
                    self.increment();
                }
                self.last_signal = new;
            }
            _ => {}
        }
    }

    /// Advance the timer by `ticks` CPU clocks, raising the Timer interrupt
    /// when a delayed reload lands.
    pub fn step(&mut self, ticks: u16, if_reg: &mut u8) {
        for _ in 0..ticks {
            self.apply_pending_reload(if_reg);
            self.div = self.div.wrapping_add(1);
            let new = self.signal();
            if self.last_signal && !new {
                self.increment();
            }
            self.last_signal = new;
        }
    }

    /// Force the divider to `value`. A falling edge on the selected bit
    /// still clocks TIMA, which is why resetting DIV can bump the counter.
    pub fn set_div(&mut self, value: u16, if_reg: &mut u8) {
        self.apply_pending_reload(if_reg);
        let prev = Self::signal_with(self.div, self.tac);
        self.div = value;
        let new = Self::signal_with(self.div, self.tac);
        if prev && !new {
            self.increment();
        }
        self.last_signal = new;
    }

    /// True while TIMA sits at zero waiting for the TMA reload.
    pub fn reload_pending(&self) -> bool {
        self.pending_reload
    }

    fn apply_pending_reload(&mut self, if_reg: &mut u8) {
        self.reloading = false;
        if !self.pending_reload {
            return;
        }
        if self.reload_delay == 0 {
            self.tima = self.tma;
            self.pending_reload = false;
            self.reloading = true;
            interrupt::request(if_reg, Interrupt::Timer);
        } else {
            self.reload_delay -= 1;
        }
    }

    fn increment(&mut self) {
        if self.tima == 0xFF {
            self.tima = 0;
            self.pending_reload = true;
            self.reload_delay = RELOAD_DELAY;
        } else {
            self.tima += 1;
        }
    }

    fn signal(&self) -> bool {
        Self::signal_with(self.div, self.tac)
    }

    /// Divider bit watched for the selected rate, gated by the enable bit.
    fn signal_with(div: u16, tac: u8) -> bool {
        if tac & 0x04 == 0 {
            return false;
        }
        let bit = match tac & 0x03 {
            0x00 => 9, // 4096 Hz
            0x01 => 3, // 262144 Hz
            0x02 => 5, // 65536 Hz
            _ => 7,    // 16384 Hz
        };
        (div >> bit) & 1 != 0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
