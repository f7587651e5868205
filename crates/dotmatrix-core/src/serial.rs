use serde::{Deserialize, Serialize};

use crate::interfaces::{NullLink, SerialLink};
use crate::interrupt::{self, Interrupt};

fn default_link() -> Box<dyn SerialLink> {
    Box::new(NullLink)
}

/// SB/SC registers and the shift logic behind them. Bits are clocked by
/// falling edges of the system divider, so the rates follow the CPU clock
/// in both speed modes.
#[derive(Serialize, Deserialize)]
pub struct Serial {
    sb: u8,
    sc: u8,
    cgb_mode: bool,
    transfer: Option<TransferState>,
    #[serde(skip, default = "default_link")]
    link: Box<dyn SerialLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferState {
    remaining_bits: u8,
    outgoing: u8,
    pending_in: u8,
    internal_clock: bool,
    fast_clock: bool,
}

impl TransferState {
    fn new(outgoing: u8, incoming: u8, sc: u8) -> Self {
        Self {
            remaining_bits: 8,
            outgoing,
            pending_in: incoming,
            internal_clock: sc & 0x01 != 0,
            fast_clock: sc & 0x02 != 0,
        }
    }

    /// Shift one bit in; returns true once all eight have moved.
    fn shift(&mut self, sb: &mut u8) -> bool {
        let incoming_bit = (self.pending_in & 0x80) != 0;
        self.pending_in <<= 1;
        *sb = (*sb << 1) | incoming_bit as u8;
        self.remaining_bits -= 1;
        self.remaining_bits == 0
    }
}

impl Serial {
    pub fn new(cgb: bool) -> Self {
        Self {
            sb: 0,
            sc: 0,
            cgb_mode: cgb,
            transfer: None,
            link: default_link(),
        }
    }

    pub fn connect(&mut self, link: Box<dyn SerialLink>) {
        self.link = link;
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF01 => self.sb,
            // Bit 1 (clock speed) only exists on CGB.
            0xFF02 if self.cgb_mode => self.sc | 0x7C,
            0xFF02 => self.sc | 0x7E,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF01 => self.sb = val,
            0xFF02 => {
                self.sc = if self.cgb_mode { val & 0x83 } else { val & 0x81 };
                if self.sc & 0x80 == 0 {
                    self.transfer = None;
                    return;
                }
                let incoming = self.link.receive_data();
                self.transfer = Some(TransferState::new(self.sb, incoming, self.sc));
            }
            _ => {}
        }
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Advance across the divider change `prev_div -> curr_div`.
    pub fn step(&mut self, prev_div: u16, curr_div: u16, if_reg: &mut u8) {
        let Some(state) = self.transfer.as_mut() else {
            return;
        };
        // With an external clock nothing moves until a partner drives the line.
        if !state.internal_clock {
            return;
        }
        let bit = if state.fast_clock { 3 } else { 8 };
        let mut complete = false;
        let mut div = prev_div;
        while div != curr_div {
            let next = div.wrapping_add(1);
            let falling = (div >> bit) & 1 == 1 && (next >> bit) & 1 == 0;
            div = next;
            if falling && state.shift(&mut self.sb) {
                complete = true;
                break;
            }
        }

        if complete && let Some(state) = self.transfer.take() {
            self.link.send_data(state.outgoing);
            self.sc &= 0x7F;
            interrupt::request(if_reg, Interrupt::Serial);
        }
    }

    /// Replace registers and transfer progress, keeping the attached link.
    pub fn restore(&mut self, other: Serial) {
        let link = std::mem::replace(&mut self.link, default_link());
        *self = other;
        self.link = link;
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serial")
            .field("sb", &self.sb)
            .field("sc", &self.sc)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_start_bit_cancels_transfer() {
        let mut serial = Serial::new(false);
        serial.write(0xFF01, 0x12);
        serial.write(0xFF02, 0x81);
        assert!(serial.transfer_active());
        serial.write(0xFF02, 0x01);
        assert!(!serial.transfer_active());

        let mut if_reg = 0;
        serial.step(0, 0x2000, &mut if_reg);
        assert_eq!(if_reg, 0);
        assert_eq!(serial.read(0xFF01), 0x12);
    }

    #[test]
    fn external_clock_never_completes_alone() {
        let mut serial = Serial::new(false);
        serial.write(0xFF02, 0x80);
        let mut if_reg = 0;
        serial.step(0, 0x8000, &mut if_reg);
        assert!(serial.transfer_active());
        assert_eq!(serial.read(0xFF02), 0xFE);
    }
}
