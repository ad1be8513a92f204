//! Per-CPU execution context and EXECUTE.

use std::sync::Arc;

use crate::exception::Exception;
use crate::interp::read_operand;
use crate::interrupts::{
    deliver_external, deliver_program_interrupt, deliver_restart, ext_code, lowcore, store_status,
};
use crate::machine::{ExternalMask, ExternalRequest, Machine, ResetKind, RunState};
use crate::mem::CpuBus;
use crate::paging_bus::PagingBus;
use crate::state::{
    insn_len, CpuState, PswMask, CR0_CLOCK_COMPARATOR, CR0_CPU_TIMER, CR0_EMERGENCY_SIGNAL,
    CR0_EXTERNAL_CALL, CR0_SERVICE_SIGNAL,
};

/// An instruction image as fetched from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub bytes: [u8; 6],
    pub len: u8,
}

impl Insn {
    pub fn new(image: &[u8]) -> Option<Self> {
        let len = insn_len(*image.first()?);
        let mut bytes = [0u8; 6];
        bytes[..len as usize].copy_from_slice(image.get(..len as usize)?);
        Some(Self { bytes, len })
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// EXECUTE and EXECUTE RELATIVE LONG may not be the target of an execute.
    fn is_execute(&self) -> bool {
        self.bytes[0] == 0x44 || (self.bytes[0] == 0xc6 && self.bytes[1] & 0x0f == 0)
    }
}

/// Runs one decoded instruction image on behalf of EXECUTE.
///
/// The dispatch engine implements this; the image it receives already carries the modification
/// byte.
pub trait Dispatch<B: CpuBus> {
    fn dispatch(&mut self, cpu: &mut CpuState, bus: &mut B, insn: &Insn) -> Result<(), Exception>;
}

impl<B, F> Dispatch<B> for F
where
    B: CpuBus,
    F: FnMut(&mut CpuState, &mut B, &Insn) -> Result<(), Exception>,
{
    fn dispatch(&mut self, cpu: &mut CpuState, bus: &mut B, insn: &Insn) -> Result<(), Exception> {
        self(cpu, bus, insn)
    }
}

/// EXECUTE: runs the instruction at `target` with bits 8-15 ORed with the low byte of R1.
///
/// R1 = 0 executes the target unmodified.
pub fn ex<B: CpuBus, D: Dispatch<B>>(
    cpu: &mut CpuState,
    bus: &mut B,
    dispatch: &mut D,
    r1: usize,
    target: u64,
) -> Result<(), Exception> {
    let target = cpu.wrap_address(target);
    if target & 1 != 0 {
        return Err(Exception::Specification);
    }
    let mut image = [0u8; 6];
    read_operand(cpu, bus, target, &mut image[..2])?;
    let len = insn_len(image[0]) as usize;
    if len > 2 {
        read_operand(cpu, bus, target.wrapping_add(2), &mut image[2..len])?;
    }
    if r1 != 0 {
        image[1] |= cpu.gpr[r1] as u8;
    }
    let insn = Insn {
        bytes: image,
        len: len as u8,
    };
    if insn.is_execute() {
        return Err(Exception::Execute);
    }
    dispatch.dispatch(cpu, bus, &insn)
}

/// One CPU of a [`Machine`]: its architected state, its view of storage and the configuration it
/// belongs to.
///
/// The dispatch engine owns the `Vcpu` on the thread that runs the CPU, calls helpers with
/// `&mut vcpu.state` and `&mut vcpu.bus`, and calls [`Vcpu::service_requests`] between
/// instructions (or whenever a helper ends with [`crate::interp::Completion::Interrupted`]).
pub struct Vcpu {
    pub state: CpuState,
    pub bus: PagingBus,
    machine: Arc<Machine>,
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("state", &self.state)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Vcpu {
    pub(crate) fn new(state: CpuState, mut bus: PagingBus, machine: Arc<Machine>) -> Self {
        bus.sync(&state);
        Self {
            state,
            bus,
            machine,
        }
    }

    #[inline]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    #[inline]
    pub fn cpu_addr(&self) -> u16 {
        self.state.cpu_addr
    }

    pub fn run_state(&self) -> RunState {
        self.machine
            .run_state(self.state.cpu_addr)
            .unwrap_or(RunState::CheckStop)
    }

    /// Delivers a program interruption for an instruction of length `ilen` that failed with `exc`.
    pub fn raise(&mut self, exc: Exception, ilen: u8) -> Result<(), Exception> {
        deliver_program_interrupt(&mut self.state, &mut self.bus, exc, ilen)
    }

    /// Applies the requests other CPUs posted and delivers at most one enabled external
    /// interruption. Returns whether anything was done.
    ///
    /// An error means the lowcore itself was inaccessible; the CPU should be check-stopped.
    pub fn service_requests(&mut self) -> Result<bool, Exception> {
        let addr = self.state.cpu_addr;
        let requests = self.machine.take_requests(addr);
        let mut acted = false;

        if let Some(kind) = requests.reset {
            tracing::debug!(cpu = addr, ?kind, "cpu reset");
            match kind {
                ResetKind::Initial => self.state.initial_reset(),
                ResetKind::Cpu => self.state.cpu_reset(),
            }
            self.bus.purge_tlb();
            self.bus.sync(&self.state);
            acted = true;
        }
        if let Some(prefix) = requests.set_prefix {
            self.state.prefix = prefix;
            self.bus.purge_tlb();
            self.bus.sync(&self.state);
            acted = true;
        }
        if requests.store_status {
            let now = self.machine.tod_read();
            store_status(&self.state, &mut self.bus, lowcore::SAVE_AREA, now)?;
            acted = true;
        }
        if let Some(area) = requests.store_status_at {
            let now = self.machine.tod_read();
            store_status(&self.state, &mut self.bus, area, now)?;
            acted = true;
        }
        if requests.restart {
            deliver_restart(&mut self.state, &mut self.bus)?;
            acted = true;
        }

        if self.run_state() != RunState::Operating {
            return Ok(acted);
        }
        Ok(self.deliver_external()? || acted)
    }

    fn deliver_external(&mut self) -> Result<bool, Exception> {
        if !self.state.psw.mask.contains(PswMask::EXT) {
            return Ok(false);
        }
        let cr0 = self.state.cr[0];
        let mask = ExternalMask {
            emergency_signal: cr0 & CR0_EMERGENCY_SIGNAL != 0,
            external_call: cr0 & CR0_EXTERNAL_CALL != 0,
            service_signal: cr0 & CR0_SERVICE_SIGNAL != 0,
        };
        let addr = self.state.cpu_addr;

        // Emergency signal and external call outrank the timing conditions.
        let posted = self.machine.take_external(addr, mask);
        match posted {
            Some(ExternalRequest::EmergencySignal { source }) => {
                deliver_external(
                    &mut self.state,
                    &mut self.bus,
                    ext_code::EMERGENCY_SIGNAL,
                    Some(source),
                )?;
                return Ok(true);
            }
            Some(ExternalRequest::ExternalCall { source }) => {
                deliver_external(
                    &mut self.state,
                    &mut self.bus,
                    ext_code::EXTERNAL_CALL,
                    Some(source),
                )?;
                return Ok(true);
            }
            _ => {}
        }

        let now = self.machine.tod_read();
        let timing = if cr0 & CR0_CLOCK_COMPARATOR != 0 && now >= self.state.clock_comparator {
            Some(ext_code::CLOCK_COMPARATOR)
        } else if cr0 & CR0_CPU_TIMER != 0 && self.state.cpu_timer.expired(now) {
            Some(ext_code::CPU_TIMER)
        } else {
            None
        };
        if let Some(code) = timing {
            if let Some(ExternalRequest::ServiceSignal { param }) = posted {
                // Still pending; hand it back for the next boundary.
                self.machine.post_service_signal(addr, param);
            }
            deliver_external(&mut self.state, &mut self.bus, code, None)?;
            return Ok(true);
        }

        if let Some(ExternalRequest::ServiceSignal { param }) = posted {
            self.bus.write_real_u32(lowcore::EXT_PARAMS, param)?;
            deliver_external(
                &mut self.state,
                &mut self.bus,
                ext_code::SERVICE_SIGNAL,
                None,
            )?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        self.machine.detach_vcpu(self.state.cpu_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{sigp_order, MachineConfig, SigpResult, STORAGE_INCREMENT};
    use crate::mem::FlatTestBus;
    use zarch_time::FakeHostClock;

    fn recorder() -> impl FnMut(&mut CpuState, &mut FlatTestBus, &Insn) -> Result<(), Exception> {
        |cpu: &mut CpuState, _bus: &mut FlatTestBus, insn: &Insn| {
            cpu.gpr[15] = u64::from_be_bytes([
                0,
                0,
                insn.bytes[0],
                insn.bytes[1],
                insn.bytes[2],
                insn.bytes[3],
                insn.bytes[4],
                insn.bytes[5],
            ]);
            Ok(())
        }
    }

    #[test]
    fn execute_ors_the_register_byte_into_the_target() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x2000);
        // MVC 0(1,R2),0(R3) with a zero length field.
        bus.load(0x1000, &[0xd2, 0x00, 0x20, 0x00, 0x30, 0x00]);
        cpu.gpr[4] = 0xffff_ff07;
        ex(&mut cpu, &mut bus, &mut recorder(), 4, 0x1000).unwrap();
        assert_eq!(cpu.gpr[15], 0xd207_2000_3000);
    }

    #[test]
    fn execute_with_r1_zero_is_direct_execution() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x2000);
        bus.load(0x1000, &[0x18, 0x12]);
        cpu.gpr[0] = 0xff;
        ex(&mut cpu, &mut bus, &mut recorder(), 0, 0x1000).unwrap();
        assert_eq!(cpu.gpr[15], 0x1812_0000_0000);
    }

    #[test]
    fn execute_rejects_odd_targets_and_execute_targets() {
        let mut cpu = CpuState::default();
        let mut bus = FlatTestBus::new(0x2000);
        assert_eq!(
            ex(&mut cpu, &mut bus, &mut recorder(), 0, 0x1001),
            Err(Exception::Specification)
        );
        bus.load(0x1000, &[0x44, 0x00, 0x10, 0x00]);
        assert_eq!(
            ex(&mut cpu, &mut bus, &mut recorder(), 0, 0x1000),
            Err(Exception::Execute)
        );
        bus.load(0x1100, &[0xc6, 0x00, 0, 0, 0, 0]);
        assert_eq!(
            ex(&mut cpu, &mut bus, &mut recorder(), 0, 0x1100),
            Err(Exception::Execute)
        );
        // C6x2 (PFDRL) is a fine target.
        bus.load(0x1200, &[0xc6, 0x02, 0, 0, 0, 0]);
        assert!(ex(&mut cpu, &mut bus, &mut recorder(), 0, 0x1200).is_ok());
    }

    #[test]
    fn insn_from_image() {
        let insn = Insn::new(&[0x07, 0xfe, 0xaa]).unwrap();
        assert_eq!(insn.as_bytes(), &[0x07, 0xfe]);
        assert_eq!(Insn::new(&[0xd2, 0x00]), None);
        assert_eq!(Insn::new(&[]), None);
    }

    fn two_cpus() -> (Arc<Machine>, Vcpu, Vcpu) {
        let config = MachineConfig {
            cpus: 2,
            storage_size: STORAGE_INCREMENT,
            ..MachineConfig::default()
        };
        let machine =
            Arc::new(Machine::with_clock(config, Arc::new(FakeHostClock::new(1_000))).unwrap());
        let v0 = machine.create_vcpu(0).unwrap();
        let v1 = machine.create_vcpu(1).unwrap();
        (machine, v0, v1)
    }

    fn set_new_psw(machine: &Machine, at: u64, addr: u64) {
        let mask = (PswMask::EA | PswMask::BA).bits();
        machine.ram().write_u64_be(at, mask).unwrap();
        machine.ram().write_u64_be(at + 8, addr).unwrap();
    }

    #[test]
    fn emergency_signal_waits_until_enabled() {
        let (machine, _v0, mut v1) = two_cpus();
        set_new_psw(&machine, lowcore::EXTERNAL_NEW_PSW, 0x8000);
        assert_eq!(machine.sigp(0, 1, sigp_order::START, 0), SigpResult::Accepted);
        assert_eq!(
            machine.sigp(0, 1, sigp_order::EMERGENCY_SIGNAL, 0),
            SigpResult::Accepted
        );
        assert!(v1.state.interrupt_pending());
        v1.state.psw.addr = 0x4000;

        // Disabled: nothing is delivered, the signal stays queued.
        assert!(!v1.service_requests().unwrap());
        assert!(!v1.state.interrupt_pending());

        v1.state.psw.mask |= PswMask::EXT;
        v1.state.cr[0] |= CR0_EMERGENCY_SIGNAL;
        v1.bus.sync(&v1.state);
        assert!(v1.service_requests().unwrap());
        assert_eq!(v1.state.psw.addr, 0x8000);
        assert_eq!(machine.ram().read_u8(0x86).unwrap(), 0x12);
        assert_eq!(machine.ram().read_u8(0x87).unwrap(), 0x01);
        assert_eq!(machine.ram().read_u64_be(lowcore::EXTERNAL_OLD_PSW + 8).unwrap(), 0x4000);
    }

    #[test]
    fn restart_and_prefix_requests() {
        let (machine, _v0, mut v1) = two_cpus();
        assert_eq!(
            machine.sigp(0, 1, sigp_order::SET_PREFIX, 0x2_0000),
            SigpResult::Accepted
        );
        assert!(v1.service_requests().unwrap());
        assert_eq!(v1.state.prefix, 0x2_0000);

        set_new_psw(&machine, 0x2_0000 + lowcore::RESTART_NEW_PSW, 0x9000);
        assert_eq!(machine.sigp(0, 1, sigp_order::RESTART, 0), SigpResult::Accepted);
        assert!(v1.service_requests().unwrap());
        assert_eq!(v1.state.psw.addr, 0x9000);
        assert_eq!(v1.run_state(), RunState::Operating);
    }

    #[test]
    fn stop_and_store_status_saves_registers() {
        let (machine, _v0, mut v1) = two_cpus();
        v1.state.gpr[2] = 0xfeed;
        assert_eq!(
            machine.sigp(0, 1, sigp_order::STOP_AND_STORE_STATUS, 0),
            SigpResult::Accepted
        );
        assert!(v1.service_requests().unwrap());
        assert_eq!(
            machine.ram().read_u64_be(lowcore::SAVE_AREA + 0x80 + 16).unwrap(),
            0xfeed
        );
        assert_eq!(v1.run_state(), RunState::Stopped);
    }

    #[test]
    fn clock_comparator_fires_once_the_tod_passes_it() {
        let (machine, mut v0, _v1) = two_cpus();
        set_new_psw(&machine, lowcore::EXTERNAL_NEW_PSW, 0x7000);
        v0.state.psw.mask |= PswMask::EXT;
        v0.state.cr[0] |= CR0_CLOCK_COMPARATOR;
        v0.state.clock_comparator = u64::MAX;
        assert!(!v0.service_requests().unwrap());
        v0.state.clock_comparator = 0;
        assert!(v0.service_requests().unwrap());
        assert_eq!(v0.state.psw.addr, 0x7000);
        assert_eq!(machine.ram().read_u8(0x87).unwrap(), 0x04);
    }
}
