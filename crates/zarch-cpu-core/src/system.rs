//! Privileged and semi-privileged system-control operations.
//!
//! These helpers touch configuration-wide state (SIGP, the TOD clock, TLB broadcasts) through the
//! [`Machine`], and CPU-local control state (control registers, prefix, storage keys) directly.
//! Any change to the translation context is followed by [`CpuBus::sync`].

use zarch_mem::dat::{page_entry_addr, PAGE_ENTRY_INVALID};
use zarch_mem::{StorageKey, PREFIX_AREA_SIZE};

use crate::exception::Exception;
use crate::machine::{Machine, SigpResult};
use crate::mem::{CpuBus, Space};
use crate::state::{
    AddressSpace, CpuState, PswMask, CR0_SECONDARY_SPACE, PREFIX_MASK, TRANSLATION_CONTROL_REGS,
};

fn check_aligned(addr: u64, size: u64) -> Result<(), Exception> {
    if addr & (size - 1) != 0 {
        return Err(Exception::Specification);
    }
    Ok(())
}

/// SIGNAL PROCESSOR. The order code is the low byte of the second-operand address, the target
/// CPU address is in R3 and the parameter in the odd register of the R1 pair.
pub fn sigp(
    cpu: &mut CpuState,
    machine: &Machine,
    r1: usize,
    r3: usize,
    order_addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let order = order_addr as u8;
    let target = cpu.gpr[r3] as u16;
    let param = cpu.gpr[r1 | 1];
    let result = machine.sigp(cpu.cpu_addr, target, order, param);
    if let SigpResult::Status(status) = result {
        cpu.set_gpr32(r1, status);
    }
    cpu.cc = result.cc();
    Ok(())
}

/// DIAGNOSE code 0x44: voluntary time-slice end.
pub const DIAG_TIME_SLICE_END: u16 = 0x44;

/// DIAGNOSE. Code 0x44 is a no-op; everything else goes to the machine's hypervisor, and codes it
/// does not know are specification exceptions.
pub fn diag(
    cpu: &mut CpuState,
    machine: &Machine,
    r1: usize,
    r3: usize,
    code: u16,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    if code == DIAG_TIME_SLICE_END {
        return Ok(());
    }
    let answer = machine
        .hypervisor()
        .and_then(|hv| hv.diagnose(cpu.cpu_addr, code, cpu.gpr[r1], cpu.gpr[r3]));
    match answer {
        Some(value) => {
            cpu.gpr[r1] = value;
            Ok(())
        }
        None => {
            tracing::debug!(cpu = cpu.cpu_addr, code, "unsupported DIAGNOSE code");
            Err(Exception::Specification)
        }
    }
}

/// SCLP command words understood by [`servc`].
pub mod sclp {
    pub const READ_SCP_INFO: u32 = 0x0002_0001;
    pub const READ_SCP_INFO_FORCED: u32 = 0x0012_0001;

    pub const RESPONSE_NORMAL: u16 = 0x0010;
    pub const RESPONSE_INSUFFICIENT_LENGTH: u16 = 0x0300;
    pub const RESPONSE_INVALID_COMMAND: u16 = 0x01f0;
    pub const RESPONSE_BOUNDARY_VIOLATION: u16 = 0x0100;

    /// Smallest SCCB that can hold the READ SCP INFO answer.
    pub const READ_INFO_LEN: u16 = 0x20;
}

/// SERVICE CALL: a minimal service-call logical processor.
///
/// R1 holds the command word and R2 the real address of the SCCB. The reply is written into the
/// SCCB and completion is signalled with a service-signal external interruption whose parameter
/// is the SCCB address.
pub fn servc<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let command = cpu.gpr32(r1);
    let sccb = cpu.gpr[r2];
    if sccb & 7 != 0 || sccb >> 31 != 0 {
        return Err(Exception::Specification);
    }
    bus.translate_keyed(sccb, Space::Real, true, 0)?;

    let mut header = [0u8; 8];
    bus.read_bytes_keyed(sccb, Space::Real, 0, &mut header)?;
    let len = u16::from_be_bytes([header[0], header[1]]);
    let response = if sccb % 4096 + len as u64 > 4096 {
        sclp::RESPONSE_BOUNDARY_VIOLATION
    } else {
        match command {
            sclp::READ_SCP_INFO | sclp::READ_SCP_INFO_FORCED => {
                if len < sclp::READ_INFO_LEN {
                    sclp::RESPONSE_INSUFFICIENT_LENGTH
                } else {
                    let config = machine.config();
                    let increments = (config.storage_size >> 20).min(u16::MAX as u64) as u16;
                    let mut info = [0u8; 0x18];
                    info[0..2].copy_from_slice(&increments.to_be_bytes());
                    // Increment size in MiB.
                    info[2] = 1;
                    info[8..10].copy_from_slice(&config.cpus.to_be_bytes());
                    bus.write_bytes_keyed(sccb + 8, Space::Real, 0, &info)?;
                    sclp::RESPONSE_NORMAL
                }
            }
            _ => {
                tracing::debug!(command, "unsupported SCLP command");
                sclp::RESPONSE_INVALID_COMMAND
            }
        }
    };
    bus.write_bytes_keyed(sccb + 6, Space::Real, 0, &response.to_be_bytes())?;
    machine.post_service_signal(cpu.cpu_addr, sccb as u32);
    cpu.cc = 0;
    Ok(())
}

/// Maps ASCII to EBCDIC for the identification strings; unknown characters become blanks.
fn ebcdic(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => 0xf0 + (c - b'0'),
        b'A'..=b'I' => 0xc1 + (c - b'A'),
        b'J'..=b'R' => 0xd1 + (c - b'J'),
        b'S'..=b'Z' => 0xe2 + (c - b'S'),
        b'a'..=b'i' => 0x81 + (c - b'a'),
        b'j'..=b'r' => 0x91 + (c - b'j'),
        b's'..=b'z' => 0xa2 + (c - b's'),
        b'.' => 0x4b,
        b'-' => 0x60,
        b'/' => 0x61,
        b'_' => 0x6d,
        _ => 0x40,
    }
}

/// Writes `text` as blank-padded EBCDIC into `field`.
fn put_ebcdic(field: &mut [u8], text: &str) {
    field.fill(0x40);
    for (dst, src) in field.iter_mut().zip(text.bytes()) {
        *dst = ebcdic(src);
    }
}

/// Configuration level reported by STSI function code 0 (a virtual machine).
pub const STSI_CURRENT_LEVEL: u32 = 3;

/// STORE SYSTEM INFORMATION.
///
/// GR0 carries the function code (bits 32-35) and selector 1 (bits 56-63), GR1 selector 2 (bits
/// 48-63). Function code 0 returns the current level in GR0. Supported blocks are 1.1.1, 1.2.1,
/// 1.2.2, 2.2.1, 2.2.2 and 3.2.2; anything else ends with condition code 3.
pub fn stsi<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let r0 = cpu.gpr[0];
    let r1 = cpu.gpr[1];
    if r0 & 0x0fff_ff00 != 0 || r1 & 0xffff_0000 != 0 {
        return Err(Exception::Specification);
    }
    let fc = ((r0 >> 28) & 0xf) as u32;
    let sel1 = (r0 & 0xff) as u8;
    let sel2 = (r1 & 0xffff) as u16;

    if fc == 0 {
        cpu.set_gpr32(0, STSI_CURRENT_LEVEL << 28);
        cpu.cc = 0;
        return Ok(());
    }
    if fc > STSI_CURRENT_LEVEL {
        cpu.cc = 3;
        return Ok(());
    }
    let addr = cpu.wrap_address(addr);
    if addr & 0xfff != 0 {
        return Err(Exception::Specification);
    }

    let config = machine.config();
    let cpus = config.cpus;
    let mut block = vec![0u8; 4096];
    match (fc, sel1, sel2) {
        (1, 1, 1) => {
            put_ebcdic(&mut block[32..48], &config.manufacturer);
            put_ebcdic(&mut block[48..52], &format!("{:04X}", config.cpu_type));
            put_ebcdic(&mut block[64..80], &config.model);
            put_ebcdic(&mut block[80..96], &config.sequence);
            put_ebcdic(&mut block[96..100], &config.plant);
            put_ebcdic(&mut block[100..116], &config.model);
        }
        (1, 2, 1) | (2, 2, 1) => {
            put_ebcdic(&mut block[80..96], &config.sequence);
            put_ebcdic(&mut block[96..100], &config.plant);
            if fc == 2 {
                block[100..102].copy_from_slice(&cpu.cpu_addr.to_be_bytes());
            }
            block[102..104].copy_from_slice(&cpu.cpu_addr.to_be_bytes());
        }
        (1, 2, 2) => {
            // Nominal capability; only its relative size matters to the guest.
            block[32..36].copy_from_slice(&0x0000_0100u32.to_be_bytes());
            block[36..38].copy_from_slice(&cpus.to_be_bytes());
            block[38..40].copy_from_slice(&cpus.to_be_bytes());
        }
        (2, 2, 2) => {
            block[32..34].copy_from_slice(&config.lpar_number.to_be_bytes());
            // Dedicated-CPU characteristics.
            block[35] = 0x80;
            block[36..38].copy_from_slice(&cpus.to_be_bytes());
            block[38..40].copy_from_slice(&cpus.to_be_bytes());
            put_ebcdic(&mut block[44..52], &config.lpar_name);
            block[52..56].copy_from_slice(&1000u32.to_be_bytes());
        }
        (3, 2, 2) => {
            block[31] = 1;
            let vm = &mut block[32..96];
            vm[4..6].copy_from_slice(&cpus.to_be_bytes());
            vm[6..8].copy_from_slice(&cpus.to_be_bytes());
            put_ebcdic(&mut vm[12..20], &config.lpar_name);
            vm[20..24].copy_from_slice(&1000u32.to_be_bytes());
            put_ebcdic(&mut vm[24..40], "ZARCH");
        }
        _ => {
            tracing::debug!(fc, sel1, sel2, "unsupported STSI level");
            cpu.cc = 3;
            return Ok(());
        }
    }
    bus.write_bytes(addr, &block)?;
    cpu.cc = 0;
    Ok(())
}

/// SET CLOCK.
pub fn sck<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let value = bus.read_u64(cpu.wrap_address(addr))?;
    machine.tod_set(value);
    cpu.cc = 0;
    Ok(())
}

/// STORE CLOCK. Values are unique across the configuration.
pub fn stck<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    crate::interp::probe_write(cpu, bus, addr, 8)?;
    bus.write_u64(addr, machine.tod_store())?;
    cpu.cc = 0;
    Ok(())
}

/// STORE CLOCK EXTENDED: epoch index 0, the 64 TOD bits, zero low-order bits, and the
/// programmable field (always zero here).
pub fn stcke<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    let addr = cpu.wrap_address(addr);
    crate::interp::probe_write(cpu, bus, addr, 16)?;
    let tod = machine.tod_store();
    let mut out = [0u8; 16];
    out[1..9].copy_from_slice(&tod.to_be_bytes());
    bus.write_bytes(addr, &out)?;
    cpu.cc = 0;
    Ok(())
}

/// SET CLOCK COMPARATOR.
pub fn sckc<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    cpu.clock_comparator = bus.read_u64(addr)?;
    Ok(())
}

pub fn stckc<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    bus.write_u64(addr, cpu.clock_comparator)
}

/// SET CPU TIMER.
pub fn spt<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let value = bus.read_u64(addr)? as i64;
    cpu.cpu_timer.set(machine.tod_read(), value);
    Ok(())
}

pub fn stpt<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let remaining = cpu.cpu_timer.remaining(machine.tod_read());
    bus.write_u64(addr, remaining as u64)
}

/// Control registers R1 through R3, wrapping from 15 to 0.
fn control_range(r1: usize, r3: usize) -> impl Iterator<Item = usize> {
    let count = (r3 + 16 - r1) % 16 + 1;
    (0..count).map(move |i| (r1 + i) % 16)
}

/// Re-derives the translation context after control registers changed.
fn control_regs_changed<B: CpuBus>(cpu: &CpuState, bus: &mut B, changed: &[usize]) {
    if changed.iter().any(|r| TRANSLATION_CONTROL_REGS.contains(r)) {
        bus.purge_tlb();
    }
    bus.sync(cpu);
}

/// LOAD CONTROL (32): replaces the low words of CR R1 through R3.
pub fn lctl<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 4)?;
    let regs: Vec<usize> = control_range(r1, r3).collect();
    let mut words = Vec::with_capacity(regs.len());
    for i in 0..regs.len() {
        words.push(bus.read_u32(cpu.wrap_address(addr.wrapping_add(4 * i as u64)))?);
    }
    let mut changed = Vec::new();
    for (&r, word) in regs.iter().zip(words) {
        let new = (cpu.cr[r] & 0xffff_ffff_0000_0000) | word as u64;
        if new != cpu.cr[r] {
            changed.push(r);
        }
        cpu.cr[r] = new;
    }
    control_regs_changed(cpu, bus, &changed);
    Ok(())
}

/// LOAD CONTROL (64).
pub fn lctlg<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let regs: Vec<usize> = control_range(r1, r3).collect();
    let mut values = Vec::with_capacity(regs.len());
    for i in 0..regs.len() {
        values.push(bus.read_u64(cpu.wrap_address(addr.wrapping_add(8 * i as u64)))?);
    }
    let mut changed = Vec::new();
    for (&r, value) in regs.iter().zip(values) {
        if value != cpu.cr[r] {
            changed.push(r);
        }
        cpu.cr[r] = value;
    }
    control_regs_changed(cpu, bus, &changed);
    Ok(())
}

/// STORE CONTROL (32).
pub fn stctl<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 4)?;
    let image: Vec<u8> = control_range(r1, r3)
        .flat_map(|r| (cpu.cr[r] as u32).to_be_bytes())
        .collect();
    crate::interp::write_operand(cpu, bus, addr, &image)
}

/// STORE CONTROL (64).
pub fn stctg<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r3: usize,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let image: Vec<u8> = control_range(r1, r3)
        .flat_map(|r| cpu.cr[r].to_be_bytes())
        .collect();
    crate::interp::write_operand(cpu, bus, addr, &image)
}

/// Absolute address of the frame named by a real address in a register.
fn real_frame<B: CpuBus>(cpu: &CpuState, bus: &mut B, r: usize) -> Result<u64, Exception> {
    let real = cpu.address_reg(r);
    bus.translate_keyed(real, Space::Real, false, 0)
}

/// INSERT STORAGE KEY EXTENDED: bits 56-62 of R1 receive the key, bit 63 is zero.
pub fn iske<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let abs = real_frame(cpu, bus, r2)?;
    let key = bus.storage_key(abs)?;
    cpu.gpr[r1] = (cpu.gpr[r1] & !0xff) | (key.0 & 0xfe) as u64;
    Ok(())
}

/// SET STORAGE KEY EXTENDED from bits 56-62 of R1.
pub fn sske<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let abs = real_frame(cpu, bus, r2)?;
    bus.set_storage_key(abs, StorageKey(cpu.gpr[r1] as u8 & 0xfe))
}

/// RESET REFERENCE BIT EXTENDED. The cc reports the reference and change bits as they were.
pub fn rrbe<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, r2: usize) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let abs = real_frame(cpu, bus, r2)?;
    let old = bus.reset_reference(abs)?;
    cpu.cc = ((old.referenced() as u8) << 1) | old.changed() as u8;
    Ok(())
}

/// TEST PROTECTION of the logical address `addr` with the access key in bits 56-59 of
/// `key_addr`.
///
/// cc 0 fetch and store permitted, 1 fetch only, 2 neither, 3 translation not available.
pub fn tprot<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    addr: u64,
    key_addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    let key = ((key_addr >> 4) & 0xf) as u8;
    match bus.translate_real(addr, Space::Current) {
        Ok(_) => {}
        Err(
            Exception::SegmentTranslation { .. }
            | Exception::PageTranslation { .. }
            | Exception::AsceType { .. },
        ) => {
            cpu.cc = 3;
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    cpu.cc = match bus.translate_keyed(addr, Space::Current, false, key) {
        Err(Exception::Protection { .. }) => 2,
        Err(e) => return Err(e),
        Ok(_) => match bus.translate_keyed(addr, Space::Current, true, key) {
            Err(Exception::Protection { .. }) => 1,
            Err(e) => return Err(e),
            Ok(_) => 0,
        },
    };
    Ok(())
}

/// INVALIDATE PAGE TABLE ENTRY.
///
/// R1 designates the page table, R2 the virtual address. The entry is marked invalid with an
/// interlocked update and the page is dropped from every CPU's TLB.
pub fn ipte<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let vaddr = cpu.gpr[r2] & !0xfff;
    let pte = page_entry_addr(cpu.gpr[r1] & !0x7ff, vaddr);
    let mut raw = [0u8; 8];
    bus.read_abs(pte, &mut raw)?;
    let mut old = u64::from_be_bytes(raw);
    loop {
        let seen = bus.cmpxchg_abs_u64(pte, old, old | PAGE_ENTRY_INVALID)?;
        if seen == old {
            break;
        }
        old = seen;
    }
    machine.invalidate_page_all(vaddr);
    bus.purge_tlb_page(vaddr);
    Ok(())
}

/// PURGE TLB (this CPU only).
pub fn ptlb<B: CpuBus>(cpu: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    cpu.check_privileged()?;
    bus.purge_tlb();
    Ok(())
}

/// LOAD REAL ADDRESS.
///
/// Translates through the tables of the current address space whether or not DAT is on. A
/// segment or page fault is reported as cc 1 or cc 2 with the interruption code in R1; an
/// ASCE-type fault as cc 3.
pub fn lra<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    let space = match cpu.address_space() {
        AddressSpace::Primary | AddressSpace::AccessRegister => Space::Primary,
        AddressSpace::Secondary => Space::Secondary,
        AddressSpace::Home => Space::Home,
    };
    match bus.translate_real(addr, space) {
        Ok((real, _)) => {
            if cpu.addressing_mode() == crate::state::AddressingMode::Bits64 {
                cpu.gpr[r1] = real;
            } else if real >> 31 != 0 {
                cpu.cc = 3;
                return Ok(());
            } else {
                cpu.set_gpr32(r1, real as u32);
            }
            cpu.cc = 0;
        }
        Err(exc) => {
            let cc = match exc {
                Exception::SegmentTranslation { .. } => 1,
                Exception::PageTranslation { .. } => 2,
                Exception::AsceType { .. } => 3,
                other => return Err(other),
            };
            cpu.set_gpr32(r1, 0x8000_0000 | exc.code() as u32);
            cpu.cc = cc;
        }
    }
    Ok(())
}

/// STORE USING REAL ADDRESS (32).
pub fn stura<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    r1: usize,
    r2: usize,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let real = cpu.address_reg(r2);
    check_aligned(real, 4)?;
    let key = bus.access_key();
    bus.write_bytes_keyed(real, Space::Real, key, &cpu.gpr32(r1).to_be_bytes())
}

/// SET PREFIX.
pub fn spx<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 4)?;
    let prefix = bus.read_u32(addr)? as u64 & PREFIX_MASK;
    if prefix + PREFIX_AREA_SIZE > bus.memory_size() {
        return Err(Exception::Addressing { addr: prefix });
    }
    cpu.prefix = prefix;
    bus.purge_tlb();
    bus.sync(cpu);
    Ok(())
}

/// STORE PREFIX.
pub fn stpx<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 4)?;
    bus.write_u32(addr, cpu.prefix as u32)
}

/// The CPU identification stored by STIDP: version, 24-bit serial, machine type.
pub fn cpu_id(machine: &Machine) -> u64 {
    let config = machine.config();
    ((config.cpu_version as u64) << 56)
        | (((config.cpu_serial & 0xff_ffff) as u64) << 32)
        | ((config.cpu_type as u64) << 16)
}

/// STORE CPU ID.
pub fn stidp<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    machine: &Machine,
    addr: u64,
) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    bus.write_u64(addr, cpu_id(machine))
}

/// SET ADDRESS SPACE CONTROL FAST. The new mode is in bits 52-55 of the operand address.
pub fn sacf<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    if !cpu.dat_enabled() {
        return Err(Exception::SpecialOperation);
    }
    let space = match (addr >> 8) & 0xf {
        0 => AddressSpace::Primary,
        1 => {
            if cpu.cr[0] & CR0_SECONDARY_SPACE == 0 {
                return Err(Exception::SpecialOperation);
            }
            AddressSpace::Secondary
        }
        2 => AddressSpace::AccessRegister,
        3 => {
            cpu.check_privileged()?;
            AddressSpace::Home
        }
        _ => return Err(Exception::Specification),
    };
    cpu.set_address_space(space);
    bus.sync(cpu);
    Ok(())
}

/// Mask bits that must be zero in a z/Architecture PSW.
const PSW_RESERVED: u64 = !PswMask::all().bits();

/// Validates and loads a new PSW (the cc is taken from the mask).
pub fn load_psw<B: CpuBus>(
    cpu: &mut CpuState,
    bus: &mut B,
    mask: u64,
    addr: u64,
) -> Result<(), Exception> {
    let m = PswMask::from_bits_retain(mask);
    if mask & PSW_RESERVED != 0 || (m.contains(PswMask::EA) && !m.contains(PswMask::BA)) {
        return Err(Exception::Specification);
    }
    let limit = match (m.contains(PswMask::EA), m.contains(PswMask::BA)) {
        (true, _) => u64::MAX,
        (false, true) => 0x7fff_ffff,
        (false, false) => 0x00ff_ffff,
    };
    if addr & !limit != 0 {
        return Err(Exception::Specification);
    }
    cpu.load_psw(mask, addr);
    bus.sync(cpu);
    Ok(())
}

/// LOAD PSW EXTENDED from a 16-byte doubleword-aligned operand.
pub fn lpswe<B: CpuBus>(cpu: &mut CpuState, bus: &mut B, addr: u64) -> Result<(), Exception> {
    cpu.check_privileged()?;
    let addr = cpu.wrap_address(addr);
    check_aligned(addr, 8)?;
    let psw = bus.read_u128(addr)?;
    load_psw(cpu, bus, (psw >> 64) as u64, psw as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{sigp_order, sigp_status, Hypervisor, MachineConfig, STORAGE_INCREMENT};
    use crate::mem::FlatTestBus;
    use std::sync::Arc;
    use zarch_time::FakeHostClock;

    struct Echo;

    impl Hypervisor for Echo {
        fn diagnose(&self, _cpu_addr: u16, code: u16, r1: u64, r3: u64) -> Option<u64> {
            (code == 0x500).then_some(r1 + r3)
        }
    }

    fn machine(cpus: u16) -> Arc<Machine> {
        let config = MachineConfig {
            cpus,
            storage_size: STORAGE_INCREMENT,
            ..MachineConfig::default()
        };
        Arc::new(
            Machine::with_clock(config, Arc::new(FakeHostClock::new(5_000)))
                .unwrap()
                .with_hypervisor(Arc::new(Echo)),
        )
    }

    fn problem_state() -> CpuState {
        let mut cpu = CpuState::default();
        cpu.psw.mask |= PswMask::PROBLEM;
        cpu
    }

    #[test]
    fn privileged_helpers_refuse_problem_state() {
        let m = machine(1);
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = problem_state();
        assert_eq!(
            lctl(&mut cpu, &mut bus, 0, 0, 0x100),
            Err(Exception::PrivilegedOperation)
        );
        assert_eq!(ptlb(&mut cpu, &mut bus), Err(Exception::PrivilegedOperation));
        assert_eq!(
            sigp(&mut cpu, &m, 1, 2, 0),
            Err(Exception::PrivilegedOperation)
        );
        assert_eq!(
            diag(&mut cpu, &m, 1, 2, 0x44),
            Err(Exception::PrivilegedOperation)
        );
        // STORE CLOCK is not privileged.
        stck(&mut cpu, &mut bus, &m, 0x100).unwrap();
    }

    #[test]
    fn sigp_stores_status_in_r1() {
        let m = machine(2);
        let _v0 = m.create_vcpu(0).unwrap();
        let _v1 = m.create_vcpu(1).unwrap();
        let mut cpu = CpuState::default();
        cpu.gpr[1] = 0xffff_ffff_ffff_ffff;
        cpu.gpr[3] = 1;
        sigp(&mut cpu, &m, 1, 3, sigp_order::SENSE as u64).unwrap();
        assert_eq!(cpu.cc, 1);
        assert_eq!(cpu.gpr[1], 0xffff_ffff_0000_0000 | sigp_status::STOPPED as u64);

        cpu.gpr[3] = 9;
        sigp(&mut cpu, &m, 1, 3, sigp_order::SENSE as u64).unwrap();
        assert_eq!(cpu.cc, 3);

        cpu.gpr[3] = 1;
        cpu.gpr[5] = 0x4000;
        sigp(&mut cpu, &m, 4, 3, sigp_order::SET_PREFIX as u64).unwrap();
        assert_eq!(cpu.cc, 0);
    }

    #[test]
    fn diagnose_goes_to_the_hypervisor() {
        let m = machine(1);
        let mut cpu = CpuState::default();
        cpu.gpr[2] = 40;
        cpu.gpr[4] = 2;
        diag(&mut cpu, &m, 2, 4, 0x500).unwrap();
        assert_eq!(cpu.gpr[2], 42);
        diag(&mut cpu, &m, 2, 4, DIAG_TIME_SLICE_END).unwrap();
        assert_eq!(cpu.gpr[2], 42);
        assert_eq!(
            diag(&mut cpu, &m, 2, 4, 0x9c),
            Err(Exception::Specification)
        );
    }

    #[test]
    fn read_scp_info_reports_storage_and_signals_completion() {
        let m = machine(1);
        let mut v0 = m.create_vcpu(0).unwrap();
        m.ram().write(0x3000, &0x100u16.to_be_bytes()).unwrap();
        v0.state.gpr[1] = sclp::READ_SCP_INFO as u64;
        v0.state.gpr[2] = 0x3000;
        servc(&mut v0.state, &mut v0.bus, &m, 1, 2).unwrap();
        assert_eq!(v0.state.cc, 0);
        assert_eq!(m.ram().read_u8(0x3007).unwrap(), 0x10);
        // One 1 MiB increment.
        assert_eq!(m.ram().read_u8(0x3009).unwrap(), 1);
        assert_eq!(m.ram().read_u8(0x300a).unwrap(), 1);

        v0.state.gpr[2] = 0x3004;
        assert_eq!(
            servc(&mut v0.state, &mut v0.bus, &m, 1, 2),
            Err(Exception::Specification)
        );
        v0.state.gpr[1] = 0xdead;
        v0.state.gpr[2] = 0x3000;
        servc(&mut v0.state, &mut v0.bus, &m, 1, 2).unwrap();
        assert_eq!(m.ram().read_u8(0x3006).unwrap(), 0x01);
        assert_eq!(m.ram().read_u8(0x3007).unwrap(), 0xf0);
    }

    #[test]
    fn stsi_levels() {
        let m = machine(2);
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();

        stsi(&mut cpu, &mut bus, &m, 0x1000).unwrap();
        assert_eq!(cpu.gpr[0], 0x3000_0000);

        cpu.gpr[0] = 0x1000_0001;
        cpu.gpr[1] = 1;
        stsi(&mut cpu, &mut bus, &m, 0x1000).unwrap();
        assert_eq!(cpu.cc, 0);
        // "ZARCH" in EBCDIC, blank padded.
        assert_eq!(bus.slice(0x1000 + 32, 6), &[0xe9, 0xc1, 0xd9, 0xc3, 0xc8, 0x40]);
        assert_eq!(bus.slice(0x1000 + 48, 4), &[0xf2, 0xf9, 0xf6, 0xf4]);

        cpu.gpr[0] = 0x1000_0002;
        cpu.gpr[1] = 2;
        stsi(&mut cpu, &mut bus, &m, 0x1000).unwrap();
        assert_eq!(bus.slice(0x1000 + 36, 4), &[0, 2, 0, 2]);

        cpu.gpr[0] = 0x1000_0004;
        stsi(&mut cpu, &mut bus, &m, 0x1000).unwrap();
        assert_eq!(cpu.cc, 3);

        cpu.gpr[0] = 0x1000_0001;
        cpu.gpr[1] = 1;
        assert_eq!(
            stsi(&mut cpu, &mut bus, &m, 0x1008),
            Err(Exception::Specification)
        );
        cpu.gpr[0] = 0x1000_0101;
        assert_eq!(
            stsi(&mut cpu, &mut bus, &m, 0x1000),
            Err(Exception::Specification)
        );
    }

    #[test]
    fn clock_instructions() {
        let m = machine(1);
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();
        stck(&mut cpu, &mut bus, &m, 0x100).unwrap();
        stck(&mut cpu, &mut bus, &m, 0x108).unwrap();
        let a = bus.read_u64(0x100).unwrap();
        let b = bus.read_u64(0x108).unwrap();
        assert!(b > a);

        bus.write_u64(0x200, 0x1234_0000_0000_0000).unwrap();
        sck(&mut cpu, &mut bus, &m, 0x200).unwrap();
        stcke(&mut cpu, &mut bus, &m, 0x300).unwrap();
        assert_eq!(bus.slice(0x300, 3), &[0, 0x12, 0x34]);

        bus.write_u64(0x400, 0xabcd).unwrap();
        sckc(&mut cpu, &mut bus, 0x400).unwrap();
        assert_eq!(cpu.clock_comparator, 0xabcd);
        stckc(&mut cpu, &mut bus, 0x408).unwrap();
        assert_eq!(bus.read_u64(0x408).unwrap(), 0xabcd);
        assert_eq!(sckc(&mut cpu, &mut bus, 0x404), Err(Exception::Specification));

        bus.write_u64(0x500, 1 << 20).unwrap();
        spt(&mut cpu, &mut bus, &m, 0x500).unwrap();
        stpt(&mut cpu, &mut bus, &m, 0x508).unwrap();
        assert_eq!(bus.read_u64(0x508).unwrap(), 1 << 20);
    }

    #[test]
    fn control_registers_load_and_store_with_wraparound() {
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();
        cpu.cr[15] = 0xaaaa_aaaa_0000_0000;
        bus.write_u32(0x100, 0x1111).unwrap();
        bus.write_u32(0x104, 0x2222).unwrap();
        lctl(&mut cpu, &mut bus, 15, 0, 0x100).unwrap();
        assert_eq!(cpu.cr[15], 0xaaaa_aaaa_0000_1111);
        assert_eq!(cpu.cr[0], 0x2222);
        // CR0 feeds translation.
        assert_eq!(bus.purges, 1);

        stctg(&mut cpu, &mut bus, 15, 0, 0x200).unwrap();
        assert_eq!(bus.read_u64(0x200).unwrap(), 0xaaaa_aaaa_0000_1111);
        assert_eq!(bus.read_u64(0x208).unwrap(), 0x2222);

        bus.write_u64(0x300, 0x5555).unwrap();
        lctlg(&mut cpu, &mut bus, 3, 3, 0x300).unwrap();
        assert_eq!(cpu.cr[3], 0x5555);
        assert_eq!(bus.purges, 1);
        stctl(&mut cpu, &mut bus, 3, 3, 0x400).unwrap();
        assert_eq!(bus.read_u32(0x400).unwrap(), 0x5555);
        assert_eq!(
            lctlg(&mut cpu, &mut bus, 3, 3, 0x304),
            Err(Exception::Specification)
        );
    }

    #[test]
    fn load_control_operand_wraps_at_the_top_of_storage() {
        let mut bus = FlatTestBus::new(0x100_0000);
        let mut cpu = CpuState::default();
        cpu.set_addressing_mode(crate::state::AddressingMode::Bits24);
        bus.write_u32(0xff_fffc, 0x1111).unwrap();
        bus.write_u32(0, 0x2222).unwrap();
        lctl(&mut cpu, &mut bus, 6, 7, 0xff_fffc).unwrap();
        assert_eq!(cpu.cr[6], 0x1111);
        assert_eq!(cpu.cr[7], 0x2222);

        bus.write_u64(0xff_fff8, 0x3333).unwrap();
        bus.write_u64(0, 0x4444).unwrap();
        lctlg(&mut cpu, &mut bus, 8, 9, 0xff_fff8).unwrap();
        assert_eq!(cpu.cr[8], 0x3333);
        assert_eq!(cpu.cr[9], 0x4444);
    }

    #[test]
    fn storage_key_instructions() {
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();
        cpu.gpr[1] = 0x36;
        cpu.gpr[2] = 0x2010;
        sske(&mut cpu, &mut bus, 1, 2).unwrap();
        cpu.gpr[3] = 0xffff_ffff_ffff_ffff;
        iske(&mut cpu, &mut bus, 3, 2).unwrap();
        assert_eq!(cpu.gpr[3], 0xffff_ffff_ffff_ff36);

        rrbe(&mut cpu, &mut bus, 2).unwrap();
        assert_eq!(cpu.cc, 3);
        rrbe(&mut cpu, &mut bus, 2).unwrap();
        assert_eq!(cpu.cc, 1);

        cpu.gpr[2] = 0x10_0000;
        assert!(matches!(
            iske(&mut cpu, &mut bus, 3, 2),
            Err(Exception::Addressing { .. })
        ));
    }

    #[test]
    fn tprot_reports_key_protection() {
        let mut bus = FlatTestBus::new(0x4000);
        let mut cpu = CpuState::default();
        cpu.gpr[1] = 0x30;
        cpu.gpr[2] = 0x1000;
        sske(&mut cpu, &mut bus, 1, 2).unwrap();
        // Key 0 may do anything.
        tprot(&mut cpu, &mut bus, 0x1000, 0x00).unwrap();
        assert_eq!(cpu.cc, 0);
        // Matching key.
        tprot(&mut cpu, &mut bus, 0x1000, 0x30).unwrap();
        assert_eq!(cpu.cc, 0);
        // Mismatch without fetch protection: fetch only.
        tprot(&mut cpu, &mut bus, 0x1000, 0x50).unwrap();
        assert_eq!(cpu.cc, 1);

        cpu.gpr[1] = 0x38;
        sske(&mut cpu, &mut bus, 1, 2).unwrap();
        tprot(&mut cpu, &mut bus, 0x1000, 0x50).unwrap();
        assert_eq!(cpu.cc, 2);
    }

    #[test]
    fn prefix_round_trip() {
        let mut bus = FlatTestBus::new(0x10000);
        let mut cpu = CpuState::default();
        bus.write_u32(0x100, 0x8123).unwrap();
        spx(&mut cpu, &mut bus, 0x100).unwrap();
        assert_eq!(cpu.prefix, 0x8000);
        stpx(&mut cpu, &mut bus, 0x200).unwrap();
        assert_eq!(bus.read_u32(0x200).unwrap(), 0x8000);

        bus.write_u32(0x100, 0x10000).unwrap();
        assert_eq!(
            spx(&mut cpu, &mut bus, 0x100),
            Err(Exception::Addressing { addr: 0x10000 })
        );
    }

    #[test]
    fn cpu_id_layout() {
        let m = machine(1);
        let mut bus = FlatTestBus::new(0x1000);
        let mut cpu = CpuState::default();
        stidp(&mut cpu, &mut bus, &m, 0x100).unwrap();
        assert_eq!(bus.read_u64(0x100).unwrap(), 0x0001_0000_2964_0000);
    }

    #[test]
    fn sacf_checks_controls() {
        let mut bus = FlatTestBus::new(0x1000);
        let mut cpu = CpuState::default();
        assert_eq!(sacf(&mut cpu, &mut bus, 0), Err(Exception::SpecialOperation));
        cpu.psw.mask |= PswMask::DAT;
        assert_eq!(
            sacf(&mut cpu, &mut bus, 0x100),
            Err(Exception::SpecialOperation)
        );
        cpu.cr[0] |= CR0_SECONDARY_SPACE;
        sacf(&mut cpu, &mut bus, 0x100).unwrap();
        assert_eq!(cpu.address_space(), AddressSpace::Secondary);
        sacf(&mut cpu, &mut bus, 0x300).unwrap();
        assert_eq!(cpu.address_space(), AddressSpace::Home);
        assert_eq!(sacf(&mut cpu, &mut bus, 0x400), Err(Exception::Specification));
        cpu.psw.mask |= PswMask::PROBLEM;
        assert_eq!(
            sacf(&mut cpu, &mut bus, 0x300),
            Err(Exception::PrivilegedOperation)
        );
    }

    #[test]
    fn load_psw_validates_the_mask() {
        let mut bus = FlatTestBus::new(0x1000);
        let mut cpu = CpuState::default();
        let good = (PswMask::EA | PswMask::BA).bits() | (2 << 44);
        bus.write_u64(0x100, good).unwrap();
        bus.write_u64(0x108, 0x1_0000_0000).unwrap();
        lpswe(&mut cpu, &mut bus, 0x100).unwrap();
        assert_eq!(cpu.psw.addr, 0x1_0000_0000);
        assert_eq!(cpu.cc, 2);

        assert_eq!(
            load_psw(&mut cpu, &mut bus, PswMask::EA.bits(), 0),
            Err(Exception::Specification)
        );
        assert_eq!(
            load_psw(&mut cpu, &mut bus, PswMask::BA.bits(), 0x8000_0000),
            Err(Exception::Specification)
        );
        assert_eq!(
            load_psw(&mut cpu, &mut bus, 1 << 63, 0),
            Err(Exception::Specification)
        );
        load_psw(&mut cpu, &mut bus, PswMask::WAIT.bits(), 0x100).unwrap();
        assert!(cpu.halted);
    }

    mod dat {
        use super::*;
        use zarch_mem::dat::SEGMENT_ENTRY_INVALID;

        const SEGMENT_TABLE: u64 = 0x10000;
        const PAGE_TABLE: u64 = 0x12000;

        fn mapped() -> (Arc<Machine>, crate::exec::Vcpu) {
            let m = machine(2);
            let ram = m.ram();
            for sx in 0..512 {
                ram.write_u64_be(SEGMENT_TABLE + sx * 8, SEGMENT_ENTRY_INVALID)
                    .unwrap();
            }
            ram.write_u64_be(SEGMENT_TABLE, PAGE_TABLE).unwrap();
            for px in 0..256 {
                ram.write_u64_be(PAGE_TABLE + px * 8, PAGE_ENTRY_INVALID)
                    .unwrap();
            }
            ram.write_u64_be(PAGE_TABLE + 8, 0x20000).unwrap();
            let mut v = m.create_vcpu(0).unwrap();
            v.state.cr[1] = SEGMENT_TABLE;
            v.bus.sync(&v.state);
            (m, v)
        }

        #[test]
        fn lra_translates_with_dat_off() {
            let (_m, mut v) = mapped();
            lra(&mut v.state, &mut v.bus, 4, 0x1234).unwrap();
            assert_eq!((v.state.cc, v.state.gpr[4]), (0, 0x20234));
            lra(&mut v.state, &mut v.bus, 4, 0x3000).unwrap();
            assert_eq!(v.state.cc, 2);
            assert_eq!(v.state.gpr[4] as u32, 0x8000_0011);
            lra(&mut v.state, &mut v.bus, 4, 0x10_0000).unwrap();
            assert_eq!(v.state.cc, 1);
        }

        #[test]
        fn ipte_invalidates_everywhere() {
            let (m, mut v) = mapped();
            let mut other = m.create_vcpu(1).unwrap();
            other.state.cr[1] = SEGMENT_TABLE;
            other.state.psw.mask |= PswMask::DAT;
            other.bus.sync(&other.state);
            other.bus.write_u8(0x1000, 9).unwrap();

            v.state.gpr[1] = PAGE_TABLE;
            v.state.gpr[2] = 0x1abc;
            ipte(&mut v.state, &mut v.bus, &m, 1, 2).unwrap();
            assert_eq!(
                m.ram().read_u64_be(PAGE_TABLE + 8).unwrap(),
                0x20000 | PAGE_ENTRY_INVALID
            );
            assert_eq!(
                other.bus.read_u8(0x1000),
                Err(Exception::PageTranslation { addr: 0x1000 })
            );
        }

        #[test]
        fn tprot_without_translation_is_cc3() {
            let (_m, mut v) = mapped();
            v.state.psw.mask |= PswMask::DAT;
            v.bus.sync(&v.state);
            tprot(&mut v.state, &mut v.bus, 0x5000, 0).unwrap();
            assert_eq!(v.state.cc, 3);
            tprot(&mut v.state, &mut v.bus, 0x1000, 0).unwrap();
            assert_eq!(v.state.cc, 0);
        }
    }
}
