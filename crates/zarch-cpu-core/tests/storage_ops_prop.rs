#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use zarch_cpu_core::interp::string::{clc, mvc, xc};
use zarch_cpu_core::{CpuBus, CpuState, FlatTestBus};

const A: u64 = 0x1000;
const B: u64 = 0x2000;

fn bus_with(a: &[u8], b: &[u8]) -> FlatTestBus {
    let mut bus = FlatTestBus::new(0x4000);
    bus.load(A, a);
    bus.load(B, b);
    bus
}

fn operand() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..=256)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0x5390),
        .. ProptestConfig::default()
    })]

    #[test]
    fn mvc_then_clc_compares_equal(src in operand()) {
        let mut cpu = CpuState::default();
        let mut bus = bus_with(&[], &src);
        let l = (src.len() - 1) as u8;

        mvc(&mut cpu, &mut bus, l, A, B).unwrap();
        prop_assert_eq!(bus.slice(A, src.len()), &src[..]);
        // The byte after the operand is untouched.
        prop_assert_eq!(bus.slice(A + src.len() as u64, 1), &[0u8][..]);

        clc(&mut cpu, &mut bus, l, A, B).unwrap();
        prop_assert_eq!(cpu.cc, 0);
    }

    #[test]
    fn clc_orders_like_unsigned_bytes(a in operand(), b in operand()) {
        let len = a.len().min(b.len());
        let mut cpu = CpuState::default();
        let mut bus = bus_with(&a[..len], &b[..len]);

        clc(&mut cpu, &mut bus, (len - 1) as u8, A, B).unwrap();
        let expected = match a[..len].cmp(&b[..len]) {
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Less => 1,
            std::cmp::Ordering::Greater => 2,
        };
        prop_assert_eq!(cpu.cc, expected);
    }

    #[test]
    fn mvc_one_byte_overlap_propagates(fill in any::<u8>(), len in 2usize..=256) {
        let mut cpu = CpuState::default();
        let mut bus = bus_with(&[fill], &[]);

        mvc(&mut cpu, &mut bus, (len - 2) as u8, A + 1, A).unwrap();
        prop_assert!(bus.slice(A, len).iter().all(|&b| b == fill));
    }

    #[test]
    fn xc_with_itself_clears(data in operand()) {
        let mut cpu = CpuState::default();
        let mut bus = bus_with(&data, &[]);

        xc(&mut cpu, &mut bus, (data.len() - 1) as u8, A, A).unwrap();
        prop_assert_eq!(cpu.cc, 0);
        prop_assert!(bus.slice(A, data.len()).iter().all(|&b| b == 0));
        prop_assert_eq!(bus.read_u8(A).unwrap(), 0);
    }
}
