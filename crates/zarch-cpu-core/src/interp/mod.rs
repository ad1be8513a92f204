//! Helpers for the non-floating-point instruction classes.
//!
//! Every helper takes the CPU state and the memory bus explicitly, reads its operands from
//! registers or from the effective addresses the dispatcher computed, and reports the condition
//! code through `cpu.cc`.

pub mod alu;
pub mod atomics;
pub mod decimal;
pub mod string;

use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::CpuState;
use zarch_mem::PAGE_SIZE;

/// Bytes an interruptible long instruction processes before it ends with condition code 3
/// (MVCLE, CLCLE, SRST, CLST, MVST, CKSM).
pub const DEFAULT_CPU_DETERMINED_BYTES: u64 = 4096;

/// How an interruptible instruction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The instruction finished and set its condition code.
    Done,
    /// An interruption request arrived between units of operation. The registers describe the
    /// remaining work and the instruction must be re-executed after the interruption.
    Interrupted,
}

/// Number of bytes from `addr` up to the end of the addressing-mode range, capped at `len`.
#[inline]
fn bytes_before_wrap(cpu: &CpuState, addr: u64, len: usize) -> usize {
    let mask = cpu.addressing_mode().mask();
    let room = (mask - (addr & mask)) as u128 + 1;
    room.min(len as u128) as usize
}

/// Reads an operand that may wrap around the top of the address range.
pub(crate) fn read_operand<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    addr: u64,
    buf: &mut [u8],
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    let first = bytes_before_wrap(cpu, addr, buf.len());
    bus.read_bytes(addr, &mut buf[..first])?;
    if first < buf.len() {
        bus.read_bytes(0, &mut buf[first..])?;
    }
    Ok(())
}

pub(crate) fn write_operand<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    addr: u64,
    buf: &[u8],
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    let first = bytes_before_wrap(cpu, addr, buf.len());
    if first < buf.len() {
        probe_write(cpu, bus, 0, buf.len() - first)?;
    }
    bus.write_bytes(addr, &buf[..first])?;
    if first < buf.len() {
        bus.write_bytes(0, &buf[first..])?;
    }
    Ok(())
}

/// Checks that every page of a store operand is accessible without storing anything.
pub(crate) fn probe_write<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    addr: u64,
    len: usize,
) -> Result<(), Exception> {
    let mut done = 0usize;
    while done < len {
        let at = cpu.wrap_address(addr.wrapping_add(done as u64));
        bus.translate(at, crate::mem::Space::Current, true)?;
        done += ((PAGE_SIZE - at % PAGE_SIZE) as usize).min(len - done);
    }
    Ok(())
}

/// Single byte access at a wrapped effective address.
#[inline]
pub(crate) fn load_byte<B: CpuBus>(cpu: &CpuState, bus: &mut B, addr: u64) -> Result<u8, Exception> {
    bus.read_u8(cpu.wrap_address(addr))
}

#[inline]
pub(crate) fn store_byte<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    addr: u64,
    val: u8,
) -> Result<(), Exception> {
    bus.write_u8(cpu.wrap_address(addr), val)
}
