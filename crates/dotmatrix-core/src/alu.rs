//! Flag-exact arithmetic shared by the CPU's opcode handlers.
//!
//! Every function takes the current flags and returns `(result, flags)`;
//! the low nibble of the returned flags is always zero.

// CPU flag bits as documented in gbdev.io/pandocs/The_CPU_Flags.html
pub const FLAG_Z: u8 = 0x80; // Zero
pub const FLAG_N: u8 = 0x40; // Subtract
pub const FLAG_H: u8 = 0x20; // Half Carry
pub const FLAG_C: u8 = 0x10; // Carry

#[inline(always)]
fn z(res: u8) -> u8 {
    if res == 0 { FLAG_Z } else { 0 }
}

#[inline(always)]
fn flag(cond: bool, bit: u8) -> u8 {
    if cond { bit } else { 0 }
}

/// ADD/ADC.
pub fn add8(a: u8, b: u8, carry_in: bool) -> (u8, u8) {
    let c = carry_in as u8;
    let wide = a as u16 + b as u16 + c as u16;
    let res = wide as u8;
    let half = (a & 0x0F) + (b & 0x0F) + c > 0x0F;
    (res, z(res) | flag(half, FLAG_H) | flag(wide > 0xFF, FLAG_C))
}

/// SUB/SBC/CP.
pub fn sub8(a: u8, b: u8, carry_in: bool) -> (u8, u8) {
    let c = carry_in as u8;
    let res = a.wrapping_sub(b).wrapping_sub(c);
    let half = (a & 0x0F) < (b & 0x0F) + c;
    let borrow = (a as u16) < b as u16 + c as u16;
    (
        res,
        z(res) | FLAG_N | flag(half, FLAG_H) | flag(borrow, FLAG_C),
    )
}

pub fn and8(a: u8, b: u8) -> (u8, u8) {
    let res = a & b;
    (res, z(res) | FLAG_H)
}

pub fn xor8(a: u8, b: u8) -> (u8, u8) {
    let res = a ^ b;
    (res, z(res))
}

pub fn or8(a: u8, b: u8) -> (u8, u8) {
    let res = a | b;
    (res, z(res))
}

/// Dispatch for the eight accumulator operations, indexed by opcode bits 3-5
/// (ADD ADC SUB SBC AND XOR OR CP). Returns the value A should hold afterwards.
pub fn accumulator_op(op: u8, a: u8, b: u8, f: u8) -> (u8, u8) {
    let carry = f & FLAG_C != 0;
    match op & 0x07 {
        0 => add8(a, b, false),
        1 => add8(a, b, carry),
        2 => sub8(a, b, false),
        3 => sub8(a, b, carry),
        4 => and8(a, b),
        5 => xor8(a, b),
        6 => or8(a, b),
        _ => (a, sub8(a, b, false).1),
    }
}

/// INC r; carry is preserved.
pub fn inc8(v: u8, f: u8) -> (u8, u8) {
    let res = v.wrapping_add(1);
    (res, (f & FLAG_C) | z(res) | flag(v & 0x0F == 0x0F, FLAG_H))
}

/// DEC r; carry is preserved.
pub fn dec8(v: u8, f: u8) -> (u8, u8) {
    let res = v.wrapping_sub(1);
    (
        res,
        (f & FLAG_C) | FLAG_N | z(res) | flag(v & 0x0F == 0, FLAG_H),
    )
}

/// ADD HL,rr; zero is preserved, carries come from bits 11 and 15.
pub fn add16(hl: u16, v: u16, f: u8) -> (u16, u8) {
    let res = hl.wrapping_add(v);
    let half = (hl & 0x0FFF) + (v & 0x0FFF) > 0x0FFF;
    let carry = hl as u32 + v as u32 > 0xFFFF;
    (
        res,
        (f & FLAG_Z) | flag(half, FLAG_H) | flag(carry, FLAG_C),
    )
}

/// SP plus a signed offset, as used by ADD SP,e8 and LD HL,SP+e8. Flags come
/// from the unsigned low-byte addition.
pub fn add_sp_offset(sp: u16, offset: u8) -> (u16, u8) {
    let res = sp.wrapping_add(offset as i8 as u16);
    let half = (sp & 0x000F) + (offset as u16 & 0x000F) > 0x000F;
    let carry = (sp & 0x00FF) + offset as u16 > 0x00FF;
    (res, flag(half, FLAG_H) | flag(carry, FLAG_C))
}

/// Decimal-adjust A after a BCD add or subtract.
pub fn daa(a: u8, f: u8) -> (u8, u8) {
    let subtract = f & FLAG_N != 0;
    let mut correction = 0u8;
    let mut carry = false;
    if f & FLAG_H != 0 || (!subtract && (a & 0x0F) > 9) {
        correction |= 0x06;
    }
    if f & FLAG_C != 0 || (!subtract && a > 0x99) {
        correction |= 0x60;
        carry = true;
    }
    let res = if subtract {
        a.wrapping_sub(correction)
    } else {
        a.wrapping_add(correction)
    };
    (res, z(res) | (f & FLAG_N) | flag(carry, FLAG_C))
}

/// The eight CB-prefixed rotate/shift operations, indexed by opcode bits 3-5
/// (RLC RRC RL RR SLA SRA SWAP SRL).
pub fn shift_op(op: u8, v: u8, f: u8) -> (u8, u8) {
    let carry_in = f & FLAG_C != 0;
    let (res, carry) = match op & 0x07 {
        0 => (v.rotate_left(1), v & 0x80 != 0),
        1 => (v.rotate_right(1), v & 0x01 != 0),
        2 => ((v << 1) | carry_in as u8, v & 0x80 != 0),
        3 => ((v >> 1) | ((carry_in as u8) << 7), v & 0x01 != 0),
        4 => (v << 1, v & 0x80 != 0),
        5 => ((v >> 1) | (v & 0x80), v & 0x01 != 0),
        6 => (v.rotate_left(4), false),
        _ => (v >> 1, v & 0x01 != 0),
    };
    (res, z(res) | flag(carry, FLAG_C))
}

/// RLCA/RRCA/RLA/RRA: the CB operations with Z forced clear.
pub fn rotate_a(op: u8, a: u8, f: u8) -> (u8, u8) {
    let (res, flags) = shift_op(op, a, f);
    (res, flags & FLAG_C)
}

/// BIT n,r; carry is preserved.
pub fn bit(n: u8, v: u8, f: u8) -> u8 {
    (f & FLAG_C) | FLAG_H | flag(v & (1 << n) == 0, FLAG_Z)
}
