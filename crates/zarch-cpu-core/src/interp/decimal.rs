//! Packed/zoned decimal conversions.

use super::{read_operand, write_operand};
use crate::exception::{dxc, Exception};
use crate::mem::CpuBus;
use crate::state::CpuState;

const SIGN_PLUS: u64 = 0xc;
const SIGN_MINUS: u64 = 0xd;

/// PACK: zoned source (length code `l2`) to packed destination (length code `l1`).
///
/// Only the low four bits of each length code are used.
///
/// The rightmost byte has its nibbles swapped (zone becomes the sign), the remaining digits are
/// the numeric nibbles of the source, right to left, padded with zeros. Nothing is validated.
pub fn pack<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l1: u8,
    l2: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    let len1 = (l1 & 0xf) as usize + 1;
    let len2 = (l2 & 0xf) as usize + 1;
    let mut zoned = [0u8; 16];
    read_operand(cpu, bus, src, &mut zoned[..len2])?;

    let mut digits = zoned[..len2 - 1].iter().rev().map(|b| b & 0xf);
    let mut packed = [0u8; 16];
    packed[len1 - 1] = zoned[len2 - 1].rotate_left(4);
    for d in (0..len1 - 1).rev() {
        let lo = digits.next().unwrap_or(0);
        let hi = digits.next().unwrap_or(0);
        packed[d] = (hi << 4) | lo;
    }
    write_operand(cpu, bus, dest, &packed[..len1])
}

/// UNPACK: packed source to zoned destination with zone 0xF.
pub fn unpk<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    l1: u8,
    l2: u8,
    dest: u64,
    src: u64,
) -> Result<(), Exception> {
    let len1 = (l1 & 0xf) as usize + 1;
    let len2 = (l2 & 0xf) as usize + 1;
    let mut packed = [0u8; 16];
    read_operand(cpu, bus, src, &mut packed[..len2])?;

    let mut digits = packed[..len2 - 1]
        .iter()
        .rev()
        .flat_map(|b| [b & 0xf, b >> 4]);
    let mut zoned = [0u8; 16];
    zoned[len1 - 1] = packed[len2 - 1].rotate_left(4);
    for d in (0..len1 - 1).rev() {
        zoned[d] = 0xf0 | digits.next().unwrap_or(0);
    }
    write_operand(cpu, bus, dest, &zoned[..len1])
}

/// The packed-decimal doubleword CONVERT TO DECIMAL stores for `value`.
pub fn cvd_value(value: i32) -> u64 {
    let mut dec = if value < 0 { SIGN_MINUS } else { SIGN_PLUS };
    let mut n = value.unsigned_abs() as u64;
    let mut shift = 4;
    while n > 0 {
        dec |= (n % 10) << shift;
        n /= 10;
        shift += 4;
    }
    dec
}

/// CONVERT TO DECIMAL: the signed low word of `r1` as eight bytes of packed decimal.
pub fn cvd<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    addr: u64,
) -> Result<(), Exception> {
    let dec = cvd_value(cpu.gpr32(r1) as i32);
    write_operand(cpu, bus, addr, &dec.to_be_bytes())
}

/// CONVERT TO BINARY.
///
/// Invalid digits or sign raise a decimal data exception. A value outside the 32-bit range
/// stores its low-order bits and then raises a fixed-point-divide exception.
pub fn cvb<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    addr: u64,
) -> Result<(), Exception> {
    let mut raw = [0u8; 8];
    read_operand(cpu, bus, addr, &mut raw)?;
    let dec = u64::from_be_bytes(raw);

    let sign = dec & 0xf;
    if sign < 0xa {
        return Err(Exception::Data { dxc: dxc::DECIMAL });
    }
    let mut magnitude: i64 = 0;
    for i in (1..16).rev() {
        let digit = (dec >> (i * 4)) & 0xf;
        if digit > 9 {
            return Err(Exception::Data { dxc: dxc::DECIMAL });
        }
        magnitude = magnitude * 10 + digit as i64;
    }
    let value = if sign == 0xb || sign == SIGN_MINUS {
        -magnitude
    } else {
        magnitude
    };
    cpu.set_gpr32(r1, value as u32);
    if value > i32::MAX as i64 || value < i32::MIN as i64 {
        return Err(Exception::FixedPointDivide);
    }
    Ok(())
}
