use log::debug;
#[cfg(feature = "cpu-trace")]
use log::trace;
use serde::{Deserialize, Serialize};

use crate::alu::{self, FLAG_C, FLAG_H, FLAG_N, FLAG_Z};
use crate::interrupt::{INTERRUPT_MASK, Interrupt};
use crate::mmu::Mmu;

// Post-boot CPU state from gbdev.io/pandocs/Power_Up_State.html
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const DMG_BOOT_A: u8 = 0x01;
const DMG_BOOT_F: u8 = 0xB0;
const DMG_BOOT_B: u8 = 0x00;
const DMG_BOOT_C: u8 = 0x13;
const DMG_BOOT_D: u8 = 0x00;
const DMG_BOOT_E: u8 = 0xD8;
const DMG_BOOT_H: u8 = 0x01;
const DMG_BOOT_L: u8 = 0x4D;

const CGB_BOOT_A: u8 = 0x11;
const CGB_BOOT_F: u8 = 0x80;
const CGB_BOOT_B: u8 = 0x00;
const CGB_BOOT_C: u8 = 0x00;
const CGB_BOOT_D: u8 = 0x00;
const CGB_BOOT_E: u8 = 0x08;
const CGB_BOOT_H: u8 = 0x00;
const CGB_BOOT_L: u8 = 0x7C;

/// Machine cycles spent entering an interrupt handler.
const INTERRUPT_DISPATCH_CYCLES: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    /// Machine cycles executed since power on.
    pub cycles: u64,
    pub ime: bool,
    pub halted: bool,
    /// Waiting in STOP for a button press.
    pub stopped: bool,
    halt_bug: bool,
    /// Counts down to IME being set after EI.
    ime_enable_delay: u8,
}

impl Cpu {
    /// Registers as the boot ROM leaves them.
    pub fn new(cgb: bool) -> Self {
        let (a, f, b, c, d, e, h, l) = if cgb {
            (
                CGB_BOOT_A, CGB_BOOT_F, CGB_BOOT_B, CGB_BOOT_C, CGB_BOOT_D, CGB_BOOT_E,
                CGB_BOOT_H, CGB_BOOT_L,
            )
        } else {
            (
                DMG_BOOT_A, DMG_BOOT_F, DMG_BOOT_B, DMG_BOOT_C, DMG_BOOT_D, DMG_BOOT_E,
                DMG_BOOT_H, DMG_BOOT_L,
            )
        };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            cycles: 0,
            ime: false,
            halted: false,
            stopped: false,
            halt_bug: false,
            ime_enable_delay: 0,
        }
    }

    pub fn get_af(&self) -> u16 {
        ((self.a as u16) << 8) | self.f as u16
    }

    fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = (val as u8) & 0xF0;
    }

    pub fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    pub fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    /// True while an EI has been executed but has not taken effect yet.
    pub fn ime_pending(&self) -> bool {
        self.ime_enable_delay > 0
    }

    #[inline(always)]
    fn tick(&mut self, mmu: &mut Mmu, m_cycles: u8) {
        self.cycles += m_cycles as u64;
        mmu.tick(m_cycles as u32);
    }

    #[inline(always)]
    fn fetch8(&mut self, mmu: &mut Mmu) -> u8 {
        let val = mmu.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, mmu: &mut Mmu) -> u16 {
        let lo = self.fetch8(mmu) as u16;
        let hi = self.fetch8(mmu) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8(&mut self, mmu: &mut Mmu, addr: u16) -> u8 {
        let val = mmu.read_byte(addr);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn write8(&mut self, mmu: &mut Mmu, addr: u16, val: u8) {
        mmu.write_byte(addr, val);
        self.tick(mmu, 1);
    }

    fn push_stack(&mut self, mmu: &mut Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &mut Mmu) -> u16 {
        let lo = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    /// 8-bit operand by its opcode index: B C D E H L (HL) A.
    fn read_reg(&mut self, mmu: &mut Mmu, index: u8) -> u8 {
        match index & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mmu, self.get_hl()),
            _ => self.a,
        }
    }

    fn write_reg(&mut self, mmu: &mut Mmu, index: u8, val: u8) {
        match index & 0x07 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            _ => self.a = val,
        }
    }

    /// 16-bit pair by its opcode index: BC DE HL SP.
    fn read_pair(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.get_bc(),
            1 => self.get_de(),
            2 => self.get_hl(),
            _ => self.sp,
        }
    }

    fn write_pair(&mut self, index: u8, val: u16) {
        match index & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    /// Condition by its opcode index: NZ Z NC C.
    fn condition(&self, index: u8) -> bool {
        match index & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    /// Formatted CPU state string for debugging.
    pub fn debug_state(&self) -> String {
        format!(
            "A:{:02X} F:{:02X} B:{:02X} C:{:02X} D:{:02X} E:{:02X} H:{:02X} L:{:02X} SP:{:04X} PC:{:04X} IME:{}",
            self.a,
            self.f,
            self.b,
            self.c,
            self.d,
            self.e,
            self.h,
            self.l,
            self.sp,
            self.pc,
            self.ime as u8
        )
    }

    fn handle_cb(&mut self, opcode: u8, mmu: &mut Mmu) {
        let r = opcode & 0x07;
        let n = (opcode >> 3) & 0x07;
        match opcode {
            0x00..=0x3F => {
                let val = self.read_reg(mmu, r);
                let (res, f) = alu::shift_op(n, val, self.f);
                self.write_reg(mmu, r, res);
                self.f = f;
            }
            0x40..=0x7F => {
                // BIT n,(HL) only reads, so it costs one cycle less than RES/SET.
                let val = self.read_reg(mmu, r);
                self.f = alu::bit(n, val, self.f);
            }
            0x80..=0xBF => {
                let val = self.read_reg(mmu, r);
                self.write_reg(mmu, r, val & !(1 << n));
            }
            0xC0..=0xFF => {
                let val = self.read_reg(mmu, r);
                self.write_reg(mmu, r, val | (1 << n));
            }
        }
    }

    /// Enter the highest-priority pending handler if IME allows it.
    fn handle_interrupts(&mut self, mmu: &mut Mmu) {
        if !self.ime {
            return;
        }
        let pending = mmu.if_reg & mmu.ie_reg & INTERRUPT_MASK;
        let Some(source) = Interrupt::highest(pending) else {
            return;
        };

        self.ime = false;
        self.halted = false;
        mmu.if_reg &= !source.bit();

        // EI; HALT with a request pending: the handler returns to the HALT.
        let return_pc = if self.halt_bug {
            self.halt_bug = false;
            self.pc.wrapping_sub(1)
        } else {
            self.pc
        };

        // Two idle cycles, the two-byte push, then the jump.
        self.tick(mmu, 2);
        self.push_stack(mmu, return_pc);
        self.pc = source.vector();
        self.tick(mmu, (INTERRUPT_DISPATCH_CYCLES - 4) as u8);
    }

    /// Run one instruction (or one idle machine cycle while halted, stopped
    /// or stalled by VRAM DMA), then service interrupts.
    pub fn step(&mut self, mmu: &mut Mmu) {
        if mmu.gdma_stall > 0 {
            mmu.gdma_stall -= 1;
            self.tick(mmu, 1);
            return;
        }

        if self.stopped {
            self.tick(mmu, 1);
            if mmu.joypad.any_pressed() {
                debug!("leaving STOP");
                self.stopped = false;
            }
            return;
        }

        if self.halted {
            self.tick(mmu, 1);
            if mmu.if_reg & mmu.ie_reg & INTERRUPT_MASK != 0 {
                self.halted = false;
            }
            self.handle_interrupts(mmu);
            return;
        }

        let enable_after = self.ime_enable_delay == 1;

        #[cfg(feature = "cpu-trace")]
        trace!("{}", self.debug_state());

        let opcode = if self.halt_bug {
            // The byte after HALT is read twice: PC fails to advance once.
            self.halt_bug = false;
            self.read8(mmu, self.pc)
        } else {
            self.fetch8(mmu)
        };
        self.execute(opcode, mmu);

        if enable_after && self.ime_enable_delay > 0 {
            self.ime = true;
        }
        if self.ime_enable_delay > 0 {
            self.ime_enable_delay -= 1;
        }
        self.handle_interrupts(mmu);
    }

    fn execute(&mut self, opcode: u8, mmu: &mut Mmu) {
        match opcode {
            0x00 => {}
            // LD rr,d16
            0x01 | 0x11 | 0x21 | 0x31 => {
                let val = self.fetch16(mmu);
                self.write_pair(opcode >> 4, val);
            }
            // LD (BC),A / LD (DE),A
            0x02 | 0x12 => {
                let addr = self.read_pair(opcode >> 4);
                self.write8(mmu, addr, self.a);
            }
            // LD (HL+),A / LD (HL-),A
            0x22 | 0x32 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(if opcode == 0x22 {
                    addr.wrapping_add(1)
                } else {
                    addr.wrapping_sub(1)
                });
            }
            // LD A,(BC) / LD A,(DE)
            0x0A | 0x1A => {
                let addr = self.read_pair(opcode >> 4);
                self.a = self.read8(mmu, addr);
            }
            // LD A,(HL+) / LD A,(HL-)
            0x2A | 0x3A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(if opcode == 0x2A {
                    addr.wrapping_add(1)
                } else {
                    addr.wrapping_sub(1)
                });
            }
            // INC rr / DEC rr
            0x03 | 0x13 | 0x23 | 0x33 => {
                let index = opcode >> 4;
                self.write_pair(index, self.read_pair(index).wrapping_add(1));
                self.tick(mmu, 1);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let index = opcode >> 4;
                self.write_pair(index, self.read_pair(index).wrapping_sub(1));
                self.tick(mmu, 1);
            }
            // ADD HL,rr
            0x09 | 0x19 | 0x29 | 0x39 => {
                let (res, f) = alu::add16(self.get_hl(), self.read_pair(opcode >> 4), self.f);
                self.set_hl(res);
                self.f = f;
                self.tick(mmu, 1);
            }
            // INC r
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = opcode >> 3;
                let val = self.read_reg(mmu, r);
                let (res, f) = alu::inc8(val, self.f);
                self.write_reg(mmu, r, res);
                self.f = f;
            }
            // DEC r
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = opcode >> 3;
                let val = self.read_reg(mmu, r);
                let (res, f) = alu::dec8(val, self.f);
                self.write_reg(mmu, r, res);
                self.f = f;
            }
            // LD r,d8
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let val = self.fetch8(mmu);
                self.write_reg(mmu, opcode >> 3, val);
            }
            // RLCA RRCA RLA RRA
            0x07 | 0x0F | 0x17 | 0x1F => {
                let (res, f) = alu::rotate_a(opcode >> 3, self.a, self.f);
                self.a = res;
                self.f = f;
            }
            0x08 => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.sp as u8);
                self.write8(mmu, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x10 => {
                // STOP
                let _ = self.fetch8(mmu);
                mmu.timer.set_div(0, &mut mmu.if_reg);
                if !mmu.switch_speed() {
                    debug!("entering STOP at PC={:04X}", self.pc);
                    self.stopped = true;
                }
            }
            // JR e8
            0x18 => {
                let offset = self.fetch8(mmu) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(mmu, 1);
            }
            // JR cc,e8
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(mmu) as i8;
                if self.condition(opcode >> 3) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x27 => {
                let (res, f) = alu::daa(self.a, self.f);
                self.a = res;
                self.f = f;
            }
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & FLAG_Z) | ((self.f & FLAG_C) ^ FLAG_C),
            0x76 => {
                let pending = mmu.if_reg & mmu.ie_reg & INTERRUPT_MASK;
                if self.ime || pending == 0 {
                    self.halted = true;
                } else {
                    self.halt_bug = true;
                }
            }
            // LD r,r'
            0x40..=0x7F => {
                let val = self.read_reg(mmu, opcode);
                self.write_reg(mmu, opcode >> 3, val);
            }
            // ADD ADC SUB SBC AND XOR OR CP with a register
            0x80..=0xBF => {
                let val = self.read_reg(mmu, opcode);
                let (res, f) = alu::accumulator_op(opcode >> 3, self.a, val, self.f);
                self.a = res;
                self.f = f;
            }
            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.tick(mmu, 1);
                if self.condition(opcode >> 3) {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            // POP rr
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let val = self.pop_stack(mmu);
                match opcode {
                    0xC1 => self.set_bc(val),
                    0xD1 => self.set_de(val),
                    0xE1 => self.set_hl(val),
                    _ => self.set_af(val),
                }
            }
            // JP cc,a16
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(mmu);
                if self.condition(opcode >> 3) {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xC3 => {
                self.pc = self.fetch16(mmu);
                self.tick(mmu, 1);
            }
            // CALL cc,a16
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(mmu);
                if self.condition(opcode >> 3) {
                    self.tick(mmu, 1);
                    self.push_stack(mmu, self.pc);
                    self.pc = addr;
                }
            }
            // PUSH rr
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let val = match opcode {
                    0xC5 => self.get_bc(),
                    0xD5 => self.get_de(),
                    0xE5 => self.get_hl(),
                    _ => self.get_af(),
                };
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            // ALU with d8
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch8(mmu);
                let (res, f) = alu::accumulator_op(opcode >> 3, self.a, val, self.f);
                self.a = res;
                self.f = f;
            }
            // RST
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = (opcode & 0x38) as u16;
            }
            0xC9 => {
                self.pc = self.pop_stack(mmu);
                self.tick(mmu, 1);
            }
            0xCB => {
                let cb = self.fetch8(mmu);
                self.handle_cb(cb, mmu);
            }
            0xCD => {
                let addr = self.fetch16(mmu);
                self.tick(mmu, 1);
                self.push_stack(mmu, self.pc);
                self.pc = addr;
            }
            0xD9 => {
                // RETI enables interrupts without the EI delay.
                self.pc = self.pop_stack(mmu);
                self.tick(mmu, 1);
                self.ime = true;
            }
            0xE0 => {
                let offset = self.fetch8(mmu);
                self.write8(mmu, 0xFF00 | offset as u16, self.a);
            }
            0xF0 => {
                let offset = self.fetch8(mmu);
                self.a = self.read8(mmu, 0xFF00 | offset as u16);
            }
            0xE2 => self.write8(mmu, 0xFF00 | self.c as u16, self.a),
            0xF2 => self.a = self.read8(mmu, 0xFF00 | self.c as u16),
            0xE8 => {
                let offset = self.fetch8(mmu);
                let (res, f) = alu::add_sp_offset(self.sp, offset);
                self.sp = res;
                self.f = f;
                self.tick(mmu, 2);
            }
            0xE9 => self.pc = self.get_hl(),
            0xEA => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = self.read8(mmu, addr);
            }
            0xF3 => {
                self.ime = false;
                self.ime_enable_delay = 0;
            }
            0xFB => {
                if !self.ime && self.ime_enable_delay == 0 {
                    self.ime_enable_delay = 2;
                }
            }
            0xF8 => {
                let offset = self.fetch8(mmu);
                let (res, f) = alu::add_sp_offset(self.sp, offset);
                self.set_hl(res);
                self.f = f;
                self.tick(mmu, 1);
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick(mmu, 1);
            }
            _ => panic!(
                "unhandled opcode {opcode:02X} at PC={:04X}",
                self.pc.wrapping_sub(1)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_registers_match_model() {
        let dmg = Cpu::new(false);
        assert_eq!(dmg.get_af(), 0x01B0);
        assert_eq!(dmg.get_bc(), 0x0013);
        assert_eq!(dmg.get_de(), 0x00D8);
        assert_eq!(dmg.get_hl(), 0x014D);
        let cgb = Cpu::new(true);
        assert_eq!(cgb.get_af(), 0x1180);
        assert_eq!(cgb.get_de(), 0x0008);
        assert_eq!(cgb.get_hl(), 0x007C);
        assert_eq!((cgb.pc, cgb.sp), (0x0100, 0xFFFE));
    }

    #[test]
    fn pop_af_clears_low_flag_bits() {
        let mut cpu = Cpu::new(false);
        cpu.set_af(0x12FF);
        assert_eq!(cpu.f, 0xF0);
        assert_eq!(cpu.a, 0x12);
    }
}
