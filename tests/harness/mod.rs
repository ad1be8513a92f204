#![allow(dead_code)]

use std::sync::Arc;

use zarch_cpu_core::machine::STORAGE_INCREMENT;
use zarch_cpu_core::{Machine, MachineConfig, Vcpu};

/// Fresh machine with `cpus` CPUs and 1 MiB of storage, plus a [`Vcpu`] for each of them.
pub fn boot(cpus: u16) -> (Arc<Machine>, Vec<Vcpu>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let config = MachineConfig {
        cpus,
        storage_size: STORAGE_INCREMENT,
        ..MachineConfig::default()
    };
    let machine = Arc::new(Machine::new(config).expect("valid machine config"));
    let vcpus = (0..cpus)
        .map(|addr| machine.create_vcpu(addr).expect("cpu slot available"))
        .collect();
    (machine, vcpus)
}

pub fn read_bytes(machine: &Machine, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    machine.ram().read(addr, &mut buf).expect("in range");
    buf
}

pub fn write_bytes(machine: &Machine, addr: u64, data: &[u8]) {
    machine.ram().write(addr, data).expect("in range");
}
