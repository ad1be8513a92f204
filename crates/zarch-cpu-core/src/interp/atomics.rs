//! The compare-and-swap family.
//!
//! The comparison and the conditional store are one indivisible operation on the shared storage
//! (see [`CpuBus::cmpxchg_abs_u32`] and friends), never a separate load and store. The operand is
//! translated for a store even when the comparison fails, as the architecture requires.

use crate::exception::Exception;
use crate::machine::Machine;
use crate::mem::{CpuBus, Space};
use crate::state::{check_even_pair, CpuState};

fn check_aligned(addr: u64, size: u64) -> Result<(), Exception> {
    if addr & (size - 1) != 0 {
        return Err(Exception::Specification);
    }
    Ok(())
}

/// COMPARE AND SWAP (32). cc 0 swapped, cc 1 mismatch with the current value loaded into R1.
pub fn cs<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 4)?;
    let abs = bus.translate(addr, Space::Current, true)?;
    let expected = cpu.gpr32(r1);
    let old = bus.cmpxchg_abs_u32(abs, expected, cpu.gpr32(r3))?;
    if old == expected {
        cpu.cc = 0;
    } else {
        cpu.set_gpr32(r1, old);
        cpu.cc = 1;
    }
    Ok(())
}

/// COMPARE AND SWAP (64).
pub fn csg<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let abs = bus.translate(addr, Space::Current, true)?;
    let expected = cpu.gpr[r1];
    let old = bus.cmpxchg_abs_u64(abs, expected, cpu.gpr[r3])?;
    if old == expected {
        cpu.cc = 0;
    } else {
        cpu.gpr[r1] = old;
        cpu.cc = 1;
    }
    Ok(())
}

/// COMPARE DOUBLE AND SWAP (32): the low words of the even/odd pairs form a doubleword.
pub fn cds<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    check_even_pair(r1)?;
    check_even_pair(r3)?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let abs = bus.translate(addr, Space::Current, true)?;
    let expected = ((cpu.gpr32(r1) as u64) << 32) | cpu.gpr32(r1 + 1) as u64;
    let new = ((cpu.gpr32(r3) as u64) << 32) | cpu.gpr32(r3 + 1) as u64;
    let old = bus.cmpxchg_abs_u64(abs, expected, new)?;
    if old == expected {
        cpu.cc = 0;
    } else {
        cpu.set_gpr32(r1, (old >> 32) as u32);
        cpu.set_gpr32(r1 + 1, old as u32);
        cpu.cc = 1;
    }
    Ok(())
}

/// COMPARE DOUBLE AND SWAP (64): 128-bit operand at a quadword boundary.
pub fn cdsg<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    check_even_pair(r1)?;
    check_even_pair(r3)?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 16)?;
    let abs = bus.translate(addr, Space::Current, true)?;
    let expected = ((cpu.gpr[r1] as u128) << 64) | cpu.gpr[r1 + 1] as u128;
    let new = ((cpu.gpr[r3] as u128) << 64) | cpu.gpr[r3 + 1] as u128;
    let old = bus.cmpxchg_abs_u128(abs, expected, new)?;
    if old == expected {
        cpu.cc = 0;
    } else {
        cpu.gpr[r1] = (old >> 64) as u64;
        cpu.gpr[r1 + 1] = old as u64;
        cpu.cc = 1;
    }
    Ok(())
}

/// R2 bit 63 of CSP: purge the TLBs of all CPUs after a successful swap.
const CSP_PURGE_TLB: u64 = 1;

/// COMPARE AND SWAP AND PURGE.
///
/// Compares the low word of R1 with the word at the R2 address (rounded down to a word
/// boundary) and stores the low word of R1+1 on a match. On success with the purge bit set the
/// translation buffers of every CPU in the configuration are purged through `machine`.
pub fn csp<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    check_even_pair(r1)?;
    let addr = cpu.address_reg(r2) & !3;
    let abs = bus.translate(addr, Space::Current, true)?;
    let expected = cpu.gpr32(r1);
    let old = bus.cmpxchg_abs_u32(abs, expected, cpu.gpr32(r1 + 1))?;
    if old != expected {
        cpu.set_gpr32(r1, old);
        cpu.cc = 1;
        return Ok(());
    }
    if cpu.gpr[r2] & CSP_PURGE_TLB != 0 {
        machine.purge_all_tlbs();
        bus.purge_tlb();
    }
    cpu.cc = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestBus;

    #[test]
    fn cs_mismatch_loads_current_value() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x1000);
        bus.write_u32(0x100, 7).unwrap();
        cpu.gpr[1] = 5;
        cpu.gpr[3] = 9;
        cs(&mut cpu, &mut bus, 1, 3, 0x100).unwrap();
        assert_eq!(cpu.cc, 1);
        assert_eq!(cpu.gpr[1], 7);
        assert_eq!(bus.read_u32(0x100).unwrap(), 7);

        cs(&mut cpu, &mut bus, 1, 3, 0x100).unwrap();
        assert_eq!(cpu.cc, 0);
        assert_eq!(bus.read_u32(0x100).unwrap(), 9);
    }

    #[test]
    fn misaligned_operands_are_specification_exceptions() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x1000);
        assert_eq!(
            cs(&mut cpu, &mut bus, 1, 3, 0x102),
            Err(Exception::Specification)
        );
        assert_eq!(
            csg(&mut cpu, &mut bus, 1, 3, 0x104),
            Err(Exception::Specification)
        );
        assert_eq!(
            cdsg(&mut cpu, &mut bus, 2, 4, 0x108),
            Err(Exception::Specification)
        );
        assert_eq!(
            cdsg(&mut cpu, &mut bus, 3, 4, 0x100),
            Err(Exception::Specification)
        );
    }

    #[test]
    fn double_width_swaps() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x1000);
        bus.write_u128(0x200, (1u128 << 64) | 2).unwrap();
        cpu.gpr[2] = 1;
        cpu.gpr[3] = 2;
        cpu.gpr[4] = 3;
        cpu.gpr[5] = 4;
        cdsg(&mut cpu, &mut bus, 2, 4, 0x200).unwrap();
        assert_eq!(cpu.cc, 0);
        assert_eq!(bus.read_u128(0x200).unwrap(), (3u128 << 64) | 4);
        cdsg(&mut cpu, &mut bus, 2, 4, 0x200).unwrap();
        assert_eq!((cpu.cc, cpu.gpr[2], cpu.gpr[3]), (1, 3, 4));

        bus.write_u64(0x300, 0x0000_0001_0000_0002).unwrap();
        cpu.gpr[6] = 1;
        cpu.gpr[7] = 2;
        cpu.gpr[8] = 0xa;
        cpu.gpr[9] = 0xb;
        cds(&mut cpu, &mut bus, 6, 8, 0x300).unwrap();
        assert_eq!(cpu.cc, 0);
        assert_eq!(bus.read_u64(0x300).unwrap(), 0x0000_000a_0000_000b);
    }
}
