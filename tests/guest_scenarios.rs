mod harness;

use std::sync::{Arc, Barrier};
use std::thread;

use zarch_cpu_core::exception::dxc;
use zarch_cpu_core::helpers::{FpRegOp, RangeOp, SsOp};
use zarch_cpu_core::interp::string;
use zarch_cpu_core::{CpuState, Exception, HelperCall, Insn, PagingBus};

use harness::{boot, read_bytes, write_bytes};

const FPC_INVALID_MASK: u32 = 0x8000_0000;

#[test]
fn move_then_clear_characters() {
    let (machine, mut vcpus) = boot(1);
    let cpu = &mut vcpus[0];
    write_bytes(&machine, 0x2000, b"ABC");

    cpu.call(HelperCall::Ss {
        op: SsOp::Mvc,
        l: 2,
        a1: 0x1000,
        a2: 0x2000,
    })
    .unwrap();
    assert_eq!(read_bytes(&machine, 0x1000, 3), b"ABC");

    cpu.call(HelperCall::Ss {
        op: SsOp::Xc,
        l: 2,
        a1: 0x1000,
        a2: 0x1000,
    })
    .unwrap();
    assert_eq!(read_bytes(&machine, 0x1000, 3), [0, 0, 0]);
    assert_eq!(cpu.state.cc, 0);
}

#[test]
fn compare_and_swap_mismatch_then_match() {
    let (machine, mut vcpus) = boot(1);
    let cpu = &mut vcpus[0];
    machine.ram().write_u32_be(0x3000, 7).unwrap();
    let cs = HelperCall::Range {
        op: RangeOp::Cs,
        r1: 1,
        r3: 2,
        addr: 0x3000,
    };

    cpu.state.set_gpr32(1, 5);
    cpu.state.set_gpr32(2, 9);
    cpu.call(cs).unwrap();
    assert_eq!(cpu.state.cc, 1);
    assert_eq!(cpu.state.gpr32(1), 7);
    assert_eq!(machine.ram().read_u32_be(0x3000).unwrap(), 7);

    // R1 now holds the current value, so the retry succeeds.
    cpu.call(cs).unwrap();
    assert_eq!(cpu.state.cc, 0);
    assert_eq!(machine.ram().read_u32_be(0x3000).unwrap(), 9);
}

#[test]
fn two_cpus_race_for_one_word() {
    let (machine, vcpus) = boot(2);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = vcpus
        .into_iter()
        .map(|mut cpu| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mine = u32::from(cpu.cpu_addr()) + 100;
                cpu.state.set_gpr32(1, 0);
                cpu.state.set_gpr32(2, mine);
                barrier.wait();
                cpu.call(HelperCall::Range {
                    op: RangeOp::Cs,
                    r1: 1,
                    r3: 2,
                    addr: 0x3000,
                })
                .unwrap();
                cpu.state.cc
            })
        })
        .collect();
    let ccs: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(ccs.iter().filter(|&&cc| cc == 0).count(), 1, "ccs: {ccs:?}");
    assert_eq!(ccs.iter().filter(|&&cc| cc == 1).count(), 1, "ccs: {ccs:?}");
    let winner = ccs.iter().position(|&cc| cc == 0).unwrap() as u32;
    assert_eq!(machine.ram().read_u32_be(0x3000).unwrap(), winner + 100);
}

#[test]
fn floating_point_compare() {
    let (_machine, mut vcpus) = boot(1);
    let cpu = &mut vcpus[0];
    let compare = |op| HelperCall::FpReg { op, r1: 0, r2: 2 };

    cpu.state.fpr[0] = 0.0f64.to_bits();
    cpu.state.fpr[2] = (-0.0f64).to_bits();
    cpu.call(compare(FpRegOp::Cdbr)).unwrap();
    assert_eq!(cpu.state.cc, 0);

    cpu.state.fpr[2] = f64::NAN.to_bits();
    cpu.call(compare(FpRegOp::Cdbr)).unwrap();
    assert_eq!(cpu.state.cc, 3);
    // Quiet compare never signals, even with the trap enabled.
    cpu.state.fpc = FPC_INVALID_MASK;
    cpu.call(compare(FpRegOp::Cdbr)).unwrap();
    assert_eq!(cpu.state.cc, 3);

    // Signaling compare traps only while the invalid mask is set.
    assert_eq!(
        cpu.call(compare(FpRegOp::Kdbr)),
        Err(Exception::Data {
            dxc: dxc::IEEE_INVALID
        })
    );
    cpu.state.fpc = 0;
    cpu.call(compare(FpRegOp::Kdbr)).unwrap();
    assert_eq!(cpu.state.cc, 3);
    assert_ne!(cpu.state.fpc & 0x0080_0000, 0);
}

fn run_mvc(cpu: &mut CpuState, bus: &mut PagingBus, insn: &Insn) -> Result<(), Exception> {
    let b = insn.as_bytes();
    assert_eq!(insn.opcode(), 0xd2);
    let d1 = u64::from(u16::from_be_bytes([b[2], b[3]]) & 0x0fff);
    let d2 = u64::from(u16::from_be_bytes([b[4], b[5]]) & 0x0fff);
    string::mvc(cpu, bus, b[1], d1, d2)
}

#[test]
fn execute_supplies_the_length() {
    let (machine, mut vcpus) = boot(1);
    let cpu = &mut vcpus[0];
    // MVC 0x400(1,0),0x500(0): length code 0.
    write_bytes(&machine, 0x3000, &[0xd2, 0x00, 0x04, 0x00, 0x05, 0x00]);
    write_bytes(&machine, 0x500, b"WXYZ");

    // R1 = 0: the target runs as written and moves one byte.
    cpu.execute(&mut run_mvc, 0, 0x3000).unwrap();
    assert_eq!(read_bytes(&machine, 0x400, 4), [b'W', 0, 0, 0]);

    // Low byte of R5 is ORed into the length field.
    cpu.state.gpr[5] = 0xffff_ff03;
    cpu.execute(&mut run_mvc, 5, 0x3000).unwrap();
    assert_eq!(read_bytes(&machine, 0x400, 4), b"WXYZ");
    assert_eq!(read_bytes(&machine, 0x3000, 2), [0xd2, 0x00]);
}

#[test]
fn execute_of_execute_is_rejected() {
    let (machine, mut vcpus) = boot(1);
    let cpu = &mut vcpus[0];
    // EX 0,0x3000
    write_bytes(&machine, 0x3000, &[0x44, 0x00, 0x30, 0x00]);
    assert_eq!(
        cpu.execute(&mut run_mvc, 0, 0x3000),
        Err(Exception::Execute)
    );
}
