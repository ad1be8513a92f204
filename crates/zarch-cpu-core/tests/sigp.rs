use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use zarch_cpu_core::interrupts::{ext_code, lowcore};
use zarch_cpu_core::machine::{sigp_order, sigp_status, STORAGE_INCREMENT};
use zarch_cpu_core::state::{CR0_EXTERNAL_CALL, CR0_SERVICE_SIGNAL};
use zarch_cpu_core::{CpuBus, Machine, MachineConfig, PswMask, RunState, SigpResult, Vcpu};

fn machine(cpus: u16) -> Arc<Machine> {
    let config = MachineConfig {
        cpus,
        storage_size: STORAGE_INCREMENT,
        ..MachineConfig::default()
    };
    Arc::new(Machine::new(config).unwrap())
}

fn set_new_psw(machine: &Machine, at: u64, addr: u64) {
    let mask = (PswMask::EA | PswMask::BA).bits();
    machine.ram().write_u64_be(at, mask).unwrap();
    machine.ram().write_u64_be(at + 8, addr).unwrap();
}

fn enable_external(vcpu: &mut Vcpu, subclass: u64) {
    vcpu.state.psw.mask |= PswMask::EA | PswMask::BA | PswMask::EXT;
    vcpu.state.cr[0] |= subclass;
    vcpu.bus.sync(&vcpu.state);
}

#[test]
fn external_call_reaches_a_cpu_on_another_thread() {
    let machine = machine(2);
    set_new_psw(&machine, lowcore::EXTERNAL_NEW_PSW, 0x7000);
    let _v0 = machine.create_vcpu(0).unwrap();
    let mut v1 = machine.create_vcpu(1).unwrap();
    assert_eq!(machine.sigp(0, 1, sigp_order::START, 0), SigpResult::Accepted);
    enable_external(&mut v1, CR0_EXTERNAL_CALL);

    let receiver = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !v1.state.interrupt_pending() {
            assert!(Instant::now() < deadline, "external call never arrived");
            thread::yield_now();
        }
        assert!(v1.service_requests().unwrap());
        v1.state.psw.addr
    });

    assert_eq!(
        machine.sigp(0, 1, sigp_order::EXTERNAL_CALL, 0),
        SigpResult::Accepted
    );
    assert_eq!(receiver.join().unwrap(), 0x7000);

    let ram = machine.ram();
    assert_eq!(ram.read_u8(lowcore::EXT_INT_CODE).unwrap(), 0x12);
    assert_eq!(ram.read_u8(lowcore::EXT_INT_CODE + 1).unwrap(), 0x02);
    assert_eq!(ram.read_u8(lowcore::EXT_CPU_ADDR + 1).unwrap(), 0);
}

#[test]
fn second_external_call_reports_pending() {
    let machine = machine(2);
    let _v0 = machine.create_vcpu(0).unwrap();
    let _v1 = machine.create_vcpu(1).unwrap();
    assert_eq!(
        machine.sigp(0, 1, sigp_order::EXTERNAL_CALL, 0),
        SigpResult::Accepted
    );
    let again = machine.sigp(0, 1, sigp_order::EXTERNAL_CALL, 0);
    assert_eq!(again, SigpResult::Status(sigp_status::EXT_CALL_PENDING));
    assert_eq!(again.cc(), 1);

    let sense = machine.sigp(0, 1, sigp_order::SENSE, 0);
    assert_eq!(
        sense,
        SigpResult::Status(sigp_status::STOPPED | sigp_status::EXT_CALL_PENDING)
    );
}

#[test]
fn detached_and_missing_cpus_are_not_operational() {
    let machine = machine(2);
    let _v0 = machine.create_vcpu(0).unwrap();
    {
        let _v1 = machine.create_vcpu(1).unwrap();
        assert_ne!(
            machine.sigp(0, 1, sigp_order::SENSE, 0),
            SigpResult::NotOperational
        );
    }
    assert_eq!(
        machine.sigp(0, 1, sigp_order::SENSE, 0),
        SigpResult::NotOperational
    );
    assert_eq!(
        machine.sigp(0, 9, sigp_order::SENSE, 0),
        SigpResult::NotOperational
    );
    assert_eq!(machine.sigp(0, 9, sigp_order::SENSE, 0).cc(), 3);
}

#[test]
fn stop_start_cycle() {
    let machine = machine(2);
    let _v0 = machine.create_vcpu(0).unwrap();
    let mut v1 = machine.create_vcpu(1).unwrap();

    assert_eq!(machine.run_state(1), Some(RunState::Stopped));
    assert_eq!(machine.sigp(0, 1, sigp_order::START, 0), SigpResult::Accepted);
    assert_eq!(v1.run_state(), RunState::Operating);
    assert_eq!(machine.sigp(0, 1, sigp_order::STOP, 0), SigpResult::Accepted);
    assert_eq!(v1.run_state(), RunState::Stopped);
    v1.service_requests().unwrap();
    assert_eq!(
        machine.sigp(0, 1, sigp_order::SENSE, 0),
        SigpResult::Status(sigp_status::STOPPED)
    );
}

#[test]
fn unknown_order_is_rejected() {
    let machine = machine(1);
    let _v0 = machine.create_vcpu(0).unwrap();
    assert_eq!(
        machine.sigp(0, 0, 0x7f, 0),
        SigpResult::Status(sigp_status::INVALID_ORDER)
    );
}

#[test]
fn service_signal_carries_its_parameter() {
    let machine = machine(1);
    set_new_psw(&machine, lowcore::EXTERNAL_NEW_PSW, 0x6000);
    let mut v0 = machine.create_vcpu(0).unwrap();
    enable_external(&mut v0, CR0_SERVICE_SIGNAL);

    machine.post_service_signal(0, 0x0001_2340);
    assert!(v0.service_requests().unwrap());
    assert_eq!(v0.state.psw.addr, 0x6000);
    let ram = machine.ram();
    assert_eq!(ram.read_u32_be(lowcore::EXT_PARAMS).unwrap(), 0x0001_2340);
    let code = (u16::from(ram.read_u8(lowcore::EXT_INT_CODE).unwrap()) << 8)
        | u16::from(ram.read_u8(lowcore::EXT_INT_CODE + 1).unwrap());
    assert_eq!(code, ext_code::SERVICE_SIGNAL);
}
