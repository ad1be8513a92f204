use crate::cc;
use crate::exception::Exception;
use crate::state::{check_even_pair, CpuState, PswMask};

/// MULTIPLY LOGICAL (64): the 128-bit product of R1+1 and `v` goes into the R1 pair.
pub fn mlg(cpu: &mut CpuState, r1: usize, v: u64) -> Result<(), Exception> {
    check_even_pair(r1)?;
    let product = cpu.gpr[r1 + 1] as u128 * v as u128;
    cpu.gpr[r1] = (product >> 64) as u64;
    cpu.gpr[r1 + 1] = product as u64;
    Ok(())
}

/// DIVIDE LOGICAL (64): the 128-bit R1 pair divided by `divisor`; remainder in R1, quotient in
/// R1+1. A zero divisor or a quotient wider than 64 bits is a fixed-point-divide exception and
/// leaves the registers unchanged.
pub fn dlg(cpu: &mut CpuState, r1: usize, divisor: u64) -> Result<(), Exception> {
    check_even_pair(r1)?;
    if divisor == 0 {
        return Err(Exception::FixedPointDivide);
    }
    let dividend = ((cpu.gpr[r1] as u128) << 64) | cpu.gpr[r1 + 1] as u128;
    let quotient = dividend / divisor as u128;
    if quotient > u64::MAX as u128 {
        return Err(Exception::FixedPointDivide);
    }
    cpu.gpr[r1] = (dividend % divisor as u128) as u64;
    cpu.gpr[r1 + 1] = quotient as u64;
    Ok(())
}

/// FIND LEFTMOST ONE: bit position into R1 (64 when none), the operand with that bit cleared
/// into R1+1. cc 0 for a zero operand, 2 otherwise.
pub fn flogr(cpu: &mut CpuState, r1: usize, v: u64) -> Result<(), Exception> {
    check_even_pair(r1)?;
    let lz = v.leading_zeros() as u64;
    cpu.gpr[r1] = lz;
    cpu.gpr[r1 + 1] = if v == 0 { 0 } else { v & !(1u64 << (63 - lz)) };
    cpu.cc = if v == 0 { 0 } else { 2 };
    Ok(())
}

/// Raises a fixed-point-overflow exception if the program mask enables it.
fn fixed_overflow(cpu: &CpuState) -> Result<(), Exception> {
    if cpu.cc == 3 && cpu.psw.mask.contains(PswMask::PM_FIXED_OVERFLOW) {
        return Err(Exception::FixedPointOverflow);
    }
    Ok(())
}

/// LOAD POSITIVE (32).
pub fn lpr(cpu: &mut CpuState, r1: usize, v: u32) -> Result<(), Exception> {
    let (r, cc) = cc::abs_i32(v as i32);
    cpu.set_gpr32(r1, r as u32);
    cpu.cc = cc;
    fixed_overflow(cpu)
}

pub fn lpgr(cpu: &mut CpuState, r1: usize, v: u64) -> Result<(), Exception> {
    let (r, cc) = cc::abs_i64(v as i64);
    cpu.gpr[r1] = r as u64;
    cpu.cc = cc;
    fixed_overflow(cpu)
}

/// LOAD NEGATIVE (32).
pub fn lnr(cpu: &mut CpuState, r1: usize, v: u32) {
    let (r, cc) = cc::nabs_i32(v as i32);
    cpu.set_gpr32(r1, r as u32);
    cpu.cc = cc;
}

pub fn lngr(cpu: &mut CpuState, r1: usize, v: u64) {
    let (r, cc) = cc::nabs_i64(v as i64);
    cpu.gpr[r1] = r as u64;
    cpu.cc = cc;
}

/// LOAD COMPLEMENT (32).
pub fn lcr(cpu: &mut CpuState, r1: usize, v: u32) -> Result<(), Exception> {
    let (r, cc) = cc::comp_s32(v as i32);
    cpu.set_gpr32(r1, r as u32);
    cpu.cc = cc;
    fixed_overflow(cpu)
}

pub fn lcgr(cpu: &mut CpuState, r1: usize, v: u64) -> Result<(), Exception> {
    let (r, cc) = cc::comp_s64(v as i64);
    cpu.gpr[r1] = r as u64;
    cpu.cc = cc;
    fixed_overflow(cpu)
}

/// ADD LOGICAL WITH CARRY (32).
pub fn alc(cpu: &mut CpuState, r1: usize, v: u32) {
    let (r, cc) = cc::addc_u32(cpu.gpr32(r1), v, cpu.cc);
    cpu.set_gpr32(r1, r);
    cpu.cc = cc;
}

pub fn alcg(cpu: &mut CpuState, r1: usize, v: u64) {
    let (r, cc) = cc::addc_u64(cpu.gpr[r1], v, cpu.cc);
    cpu.gpr[r1] = r;
    cpu.cc = cc;
}

/// SUBTRACT LOGICAL WITH BORROW (32).
pub fn slb(cpu: &mut CpuState, r1: usize, v: u32) {
    let (r, cc) = cc::slb(cpu.gpr32(r1), v, cpu.cc);
    cpu.set_gpr32(r1, r);
    cpu.cc = cc;
}

pub fn slbg(cpu: &mut CpuState, r1: usize, v: u64) {
    let (r, cc) = cc::slbg(cpu.gpr[r1], v, cpu.cc);
    cpu.gpr[r1] = r;
    cpu.cc = cc;
}
