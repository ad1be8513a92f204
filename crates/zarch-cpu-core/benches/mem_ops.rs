#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use zarch_cpu_core::interp::string::{clc, mvc, mvcle, xc};
#[cfg(not(target_arch = "wasm32"))]
use zarch_cpu_core::mem::{CpuBus, FlatTestBus};
#[cfg(not(target_arch = "wasm32"))]
use zarch_cpu_core::state::CpuState;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("ZARCH_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
const SRC_ADDR: u64 = 0x10_000;
#[cfg(not(target_arch = "wasm32"))]
const DST_ADDR: u64 = 0x30_000;

#[cfg(not(target_arch = "wasm32"))]
fn setup(len: usize) -> (CpuState, FlatTestBus) {
    let mut bus = FlatTestBus::new((DST_ADDR as usize) + len + 0x1000);
    let src: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7) ^ 0xa5).collect();
    bus.load(SRC_ADDR, &src);
    (CpuState::default(), bus)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_storage_to_storage(c: &mut Criterion) {
    let (mut cpu, mut bus) = setup(256);
    mvc(&mut cpu, &mut bus, 255, DST_ADDR, SRC_ADDR).unwrap();
    assert_eq!(
        bus.read_u8(DST_ADDR).unwrap(),
        bus.read_u8(SRC_ADDR).unwrap()
    );

    let mut group = c.benchmark_group("ss");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("mvc_256", |b| {
        b.iter(|| {
            mvc(
                black_box(&mut cpu),
                black_box(&mut bus),
                255,
                DST_ADDR,
                SRC_ADDR,
            )
            .unwrap();
        })
    });
    group.bench_function("clc_256_equal", |b| {
        b.iter(|| {
            clc(
                black_box(&mut cpu),
                black_box(&mut bus),
                255,
                DST_ADDR,
                SRC_ADDR,
            )
            .unwrap();
            debug_assert_eq!(cpu.cc, 0);
        })
    });
    group.bench_function("xc_256_clear", |b| {
        b.iter(|| {
            xc(
                black_box(&mut cpu),
                black_box(&mut bus),
                255,
                DST_ADDR,
                DST_ADDR,
            )
            .unwrap();
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_mvcle(c: &mut Criterion) {
    const LEN: u64 = 64 * 1024;
    let (mut cpu, mut bus) = setup(LEN as usize);

    let mut group = c.benchmark_group("long");
    group.throughput(Throughput::Bytes(LEN));
    group.bench_function("mvcle_64kib", |b| {
        b.iter(|| {
            cpu.gpr[2] = DST_ADDR;
            cpu.gpr[3] = LEN;
            cpu.gpr[4] = SRC_ADDR;
            cpu.gpr[5] = LEN;
            mvcle(black_box(&mut cpu), black_box(&mut bus), 2, 4, 0, LEN).unwrap();
            debug_assert_eq!(cpu.cc, 0);
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_storage_to_storage, bench_mvcle
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
