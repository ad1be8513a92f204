//! Architected interruption delivery through the lowcore.
//!
//! All lowcore locations are real addresses, so they are relocated by the CPU's prefix. Delivery
//! stores the interruption parameters, saves the current PSW as the old PSW of the class and loads
//! the class's new PSW.

use crate::exception::Exception;
use crate::mem::{CpuBus, Space};
use crate::state::CpuState;

pub mod lowcore {
    /// Service-signal parameter.
    pub const EXT_PARAMS: u64 = 0x80;
    pub const EXT_CPU_ADDR: u64 = 0x84;
    pub const EXT_INT_CODE: u64 = 0x86;
    pub const PGM_ILEN: u64 = 0x8c;
    pub const PGM_CODE: u64 = 0x8e;
    pub const DATA_EXC_CODE: u64 = 0x90;
    pub const TRANS_EXC_ADDR: u64 = 0xa8;
    pub const RESTART_OLD_PSW: u64 = 0x120;
    pub const EXTERNAL_OLD_PSW: u64 = 0x130;
    pub const PROGRAM_OLD_PSW: u64 = 0x150;
    pub const RESTART_NEW_PSW: u64 = 0x1a0;
    pub const EXTERNAL_NEW_PSW: u64 = 0x1b0;
    pub const PROGRAM_NEW_PSW: u64 = 0x1d0;
    /// Start of the architected store-status save area.
    pub const SAVE_AREA: u64 = 0x1200;
}

/// External interruption codes.
pub mod ext_code {
    pub const CLOCK_COMPARATOR: u16 = 0x1004;
    pub const CPU_TIMER: u16 = 0x1005;
    pub const EMERGENCY_SIGNAL: u16 = 0x1201;
    pub const EXTERNAL_CALL: u16 = 0x1202;
    pub const SERVICE_SIGNAL: u16 = 0x2401;
}

fn swap_psw<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    old_at: u64,
    new_at: u64,
    old_addr: u64,
) -> Result<(), Exception> {
    bus.write_real_u64(old_at, cpu.psw_mask_with_cc())?;
    bus.write_real_u64(old_at + 8, old_addr)?;
    let mask = bus.read_real_u64(new_at)?;
    let addr = bus.read_real_u64(new_at + 8)?;
    cpu.load_psw(mask, addr);
    bus.sync(cpu);
    Ok(())
}

/// Delivers a program interruption for `exc` raised by the instruction at `cpu.psw.addr`.
///
/// `ilen` is the length of that instruction. Nullifying exceptions store an old PSW that points
/// at the instruction itself; all others point past it.
pub fn deliver_program_interrupt<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    exc: Exception,
    ilen: u8,
) -> Result<(), Exception> {
    bus.sync(cpu);
    let old_addr = if exc.nullifies() {
        cpu.psw.addr
    } else {
        cpu.wrap_address(cpu.psw.addr.wrapping_add(ilen as u64))
    };

    tracing::trace!(
        code = exc.code(),
        psw_addr = cpu.psw.addr,
        ilen,
        "delivering program interruption"
    );

    bus.write_real_u16(lowcore::PGM_ILEN, ilen as u16)?;
    bus.write_real_u16(lowcore::PGM_CODE, exc.code())?;
    if let Some(addr) = exc.translation_address() {
        let teid = (addr & !0xfff) | cpu.address_space() as u64;
        bus.write_real_u64(lowcore::TRANS_EXC_ADDR, teid)?;
    }
    if let Some(dxc) = exc.data_exception_code() {
        bus.write_real_u32(lowcore::DATA_EXC_CODE, dxc as u32)?;
    }
    swap_psw(
        cpu,
        bus,
        lowcore::PROGRAM_OLD_PSW,
        lowcore::PROGRAM_NEW_PSW,
        old_addr,
    )
}

/// Delivers an external interruption. The PSW address is the resumption point (the next
/// instruction, or the interrupted one for an interruptible instruction that stopped early).
pub fn deliver_external<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    code: u16,
    source_cpu: Option<u16>,
) -> Result<(), Exception> {
    bus.sync(cpu);
    tracing::trace!(code, ?source_cpu, "delivering external interruption");
    bus.write_real_u16(lowcore::EXT_INT_CODE, code)?;
    if let Some(addr) = source_cpu {
        bus.write_real_u16(lowcore::EXT_CPU_ADDR, addr)?;
    }
    let old_addr = cpu.psw.addr;
    swap_psw(
        cpu,
        bus,
        lowcore::EXTERNAL_OLD_PSW,
        lowcore::EXTERNAL_NEW_PSW,
        old_addr,
    )
}

/// Restart interruption, as triggered by SIGP RESTART. It cannot be masked.
pub fn deliver_restart<B: CpuBus>(cpu: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    bus.sync(cpu);
    tracing::trace!(cpu = cpu.cpu_addr, "delivering restart interruption");
    let old_addr = cpu.psw.addr;
    swap_psw(
        cpu,
        bus,
        lowcore::RESTART_OLD_PSW,
        lowcore::RESTART_NEW_PSW,
        old_addr,
    )?;
    cpu.halted = false;
    Ok(())
}

/// Stores the architected status of `cpu` into the save area whose first byte (the location of
/// the floating-point registers) is at absolute address `area`.
pub fn store_status<B: CpuBus>(
    cpu: &CpuState,
    bus: &mut B,
    area: u64,
    now_tod: u64,
) -> Result<(), Exception> {
    let mut image = vec![0u8; 0x200];
    for (i, fpr) in cpu.fpr.iter().enumerate() {
        image[i * 8..i * 8 + 8].copy_from_slice(&fpr.to_be_bytes());
    }
    for (i, gpr) in cpu.gpr.iter().enumerate() {
        image[0x80 + i * 8..0x88 + i * 8].copy_from_slice(&gpr.to_be_bytes());
    }
    image[0x100..0x108].copy_from_slice(&cpu.psw_mask_with_cc().to_be_bytes());
    image[0x108..0x110].copy_from_slice(&cpu.psw.addr.to_be_bytes());
    image[0x118..0x11c].copy_from_slice(&(cpu.prefix as u32).to_be_bytes());
    image[0x11c..0x120].copy_from_slice(&cpu.fpc.to_be_bytes());
    image[0x128..0x130].copy_from_slice(&cpu.cpu_timer.remaining(now_tod).to_be_bytes());
    image[0x130..0x138].copy_from_slice(&(cpu.clock_comparator >> 8).to_be_bytes());
    for (i, ar) in cpu.ar.iter().enumerate() {
        image[0x140 + i * 4..0x144 + i * 4].copy_from_slice(&ar.to_be_bytes());
    }
    for (i, cr) in cpu.cr.iter().enumerate() {
        image[0x180 + i * 8..0x188 + i * 8].copy_from_slice(&cr.to_be_bytes());
    }
    bus.write_bytes_keyed(area, Space::Absolute, 0, &image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::dxc;
    use crate::mem::FlatTestBus;
    use crate::state::PswMask;

    fn setup() -> (CpuState, FlatTestBus) {
        let mut bus = FlatTestBus::new(0x4000);
        // Program new PSW: supervisor, 64-bit, handler at 0x3000.
        let new_mask = (PswMask::EA | PswMask::BA).bits();
        bus.load(lowcore::PROGRAM_NEW_PSW, &new_mask.to_be_bytes());
        bus.load(lowcore::PROGRAM_NEW_PSW + 8, &0x3000u64.to_be_bytes());
        let mut cpu = CpuState::default();
        cpu.psw.addr = 0x2000;
        cpu.cc = 1;
        (cpu, bus)
    }

    #[test]
    fn completing_exception_points_past_the_instruction() {
        let (mut cpu, mut bus) = setup();
        deliver_program_interrupt(&mut cpu, &mut bus, Exception::Specification, 4).unwrap();
        assert_eq!(cpu.psw.addr, 0x3000);
        assert_eq!(bus.slice(lowcore::PGM_CODE, 2), &[0, 6]);
        assert_eq!(bus.slice(lowcore::PGM_ILEN, 2), &[0, 4]);
        let old_addr = bus.read_real_u64(lowcore::PROGRAM_OLD_PSW + 8).unwrap();
        assert_eq!(old_addr, 0x2004);
        let old_mask = bus.read_real_u64(lowcore::PROGRAM_OLD_PSW).unwrap();
        assert_eq!((old_mask >> 44) & 3, 1);
    }

    #[test]
    fn nullifying_exception_points_at_the_instruction() {
        let (mut cpu, mut bus) = setup();
        let exc = Exception::PageTranslation { addr: 0x12345 };
        deliver_program_interrupt(&mut cpu, &mut bus, exc, 6).unwrap();
        assert_eq!(bus.read_real_u64(lowcore::PROGRAM_OLD_PSW + 8).unwrap(), 0x2000);
        assert_eq!(bus.read_real_u64(lowcore::TRANS_EXC_ADDR).unwrap(), 0x12000);
    }

    #[test]
    fn data_exception_stores_dxc() {
        let (mut cpu, mut bus) = setup();
        let exc = Exception::Data {
            dxc: dxc::IEEE_DIVIDE_BY_ZERO,
        };
        deliver_program_interrupt(&mut cpu, &mut bus, exc, 4).unwrap();
        assert_eq!(bus.slice(lowcore::DATA_EXC_CODE, 4), &[0, 0, 0, 0x40]);
    }

    #[test]
    fn store_status_layout() {
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();
        cpu.gpr[15] = 0x1122;
        cpu.prefix = 0x2000;
        store_status(&cpu, &mut bus, lowcore::SAVE_AREA, 0).unwrap();
        assert_eq!(
            bus.read_u64(lowcore::SAVE_AREA + 0x80 + 15 * 8).unwrap(),
            0x1122
        );
        assert_eq!(bus.read_u32(lowcore::SAVE_AREA + 0x118).unwrap(), 0x2000);
    }
}
