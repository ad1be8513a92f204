use std::sync::{Arc, Barrier};
use std::thread;

use zarch_cpu_core::interp::atomics::{cs, csg};
use zarch_cpu_core::machine::STORAGE_INCREMENT;
use zarch_cpu_core::{Exception, Machine, MachineConfig, Vcpu};

const LOCK_WORD: u64 = 0x8000;
const COUNTER: u64 = 0x8008;

fn machine(cpus: u16) -> Arc<Machine> {
    let config = MachineConfig {
        cpus,
        storage_size: STORAGE_INCREMENT,
        ..MachineConfig::default()
    };
    Arc::new(Machine::new(config).unwrap())
}

fn try_claim(vcpu: &mut Vcpu, owner: u32) -> Result<bool, Exception> {
    vcpu.state.set_gpr32(1, 0);
    vcpu.state.set_gpr32(3, owner);
    cs(&mut vcpu.state, &mut vcpu.bus, 1, 3, LOCK_WORD)?;
    Ok(vcpu.state.cc == 0)
}

#[test]
fn exactly_one_cpu_wins_a_contended_swap() {
    for _ in 0..50 {
        let machine = machine(2);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2u16)
            .map(|addr| {
                let mut vcpu = machine.create_vcpu(addr).unwrap();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let won = try_claim(&mut vcpu, u32::from(addr) + 1).unwrap();
                    (won, vcpu.state.gpr32(1))
                })
            })
            .collect();
        let results: Vec<(bool, u32)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, (won, _))| *won)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(winners.len(), 1, "results: {results:?}");
        let winner = winners[0];
        let loser = 1 - winner;

        let stored = machine.ram().read_u32_be(LOCK_WORD).unwrap();
        assert_eq!(stored, winner as u32 + 1);
        // The losing CPU observes the winner's value in its first operand.
        assert_eq!(results[loser].1, stored);
    }
}

#[test]
fn swap_loops_never_lose_an_update() {
    const ROUNDS: u64 = 2_000;
    let machine = machine(4);

    let handles: Vec<_> = (0..4u16)
        .map(|addr| {
            let mut vcpu = machine.create_vcpu(addr).unwrap();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    vcpu.state.gpr[4] = 0;
                    loop {
                        vcpu.state.gpr[5] = vcpu.state.gpr[4] + 1;
                        csg(&mut vcpu.state, &mut vcpu.bus, 4, 5, COUNTER).unwrap();
                        if vcpu.state.cc == 0 {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(machine.ram().read_u64_be(COUNTER).unwrap(), 4 * ROUNDS);
}

#[test]
fn misaligned_operand_is_a_specification_exception() {
    let machine = machine(1);
    let mut vcpu = machine.create_vcpu(0).unwrap();
    assert_eq!(
        cs(&mut vcpu.state, &mut vcpu.bus, 1, 3, LOCK_WORD + 2),
        Err(Exception::Specification)
    );
    assert_eq!(
        csg(&mut vcpu.state, &mut vcpu.bus, 1, 3, COUNTER + 4),
        Err(Exception::Specification)
    );
}
