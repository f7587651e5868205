use serde::{Deserialize, Serialize};

use crate::interrupt::{self, Interrupt};

/// A physical button. The discriminant is its bit in [`Joypad`]'s pressed mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    Right = 0,
    Left = 1,
    Up = 2,
    Down = 3,
    A = 4,
    B = 5,
    Select = 6,
    Start = 7,
}

impl Button {
    pub const ALL: [Button; 8] = [
        Button::Right,
        Button::Left,
        Button::Up,
        Button::Down,
        Button::A,
        Button::B,
        Button::Select,
        Button::Start,
    ];

    fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// The P1/JOYP register at 0xFF00.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Joypad {
    /// Bits 4-5 as last written; 0 selects that row.
    select: u8,
    /// Pressed buttons, one bit per [`Button`], active high.
    pressed: u8,
}

impl Joypad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> u8 {
        0xC0 | self.select | self.lines()
    }

    pub fn write(&mut self, val: u8, if_reg: &mut u8) {
        let before = self.lines();
        self.select = val & 0x30;
        self.raise_on_falling_lines(before, if_reg);
    }

    /// Update one button. A line that goes low while its row is selected
    /// requests the Joypad interrupt.
    pub fn set_button(&mut self, button: Button, pressed: bool, if_reg: &mut u8) {
        let before = self.lines();
        if pressed {
            self.pressed |= button.mask();
        } else {
            self.pressed &= !button.mask();
        }
        self.raise_on_falling_lines(before, if_reg);
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.pressed & button.mask() != 0
    }

    pub fn any_pressed(&self) -> bool {
        self.pressed != 0
    }

    /// Lower nibble as seen through the current row selection, active low.
    fn lines(&self) -> u8 {
        let mut low = 0;
        if self.select & 0x10 == 0 {
            low |= self.pressed & 0x0F;
        }
        if self.select & 0x20 == 0 {
            low |= self.pressed >> 4;
        }
        !low & 0x0F
    }

    fn raise_on_falling_lines(&self, before: u8, if_reg: &mut u8) {
        if before & !self.lines() != 0 {
            interrupt::request(if_reg, Interrupt::Joypad);
        }
    }
}
