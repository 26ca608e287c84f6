// Criterion benchmarks for the trace dispatch loop.
//
// The guest runs a tight counted loop so results mostly reflect trace lookup, linking and
// per-record dispatch overhead.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use trex_cpu::{
    gpr, CpuBus as _, CpuConfig, CpuMode, CpuState, ExitOnEvent, ExitReason, FlatBus, NoGuard,
    Processor,
};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("TREX_BENCH_PROFILE").as_deref() {
        Ok("full") => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
        _ => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_trace_loop(c: &mut Criterion) {
    const ITERATIONS: u64 = 10_000;
    // inc eax; dec ecx; jnz -4; hlt
    const LOOP: [u8; 5] = [0x40, 0x49, 0x75, 0xFC, 0xF4];

    let mut group = c.benchmark_group("trace_loop");
    group.throughput(Throughput::Elements(ITERATIONS * 3));

    for linked in [true, false] {
        let mut bus = FlatBus::new(0x10000).unwrap();
        bus.load(0x1000, &LOOP).unwrap();
        let config = CpuConfig {
            link_traces: linked,
            ..CpuConfig::default()
        };
        let mut cpu = Processor::new(
            0,
            config,
            CpuState::new(CpuMode::Protected),
            bus.write_stamps().clone(),
        )
        .unwrap();

        let label = if linked { "linked" } else { "unlinked" };
        group.bench_function(BenchmarkId::new("counted", label), |b| {
            b.iter(|| {
                cpu.state.rip = 0x1000;
                cpu.state.halted = false;
                cpu.state.gpr[gpr::RCX] = ITERATIONS;
                let exit = cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX);
                assert_eq!(exit, ExitReason::Halted);
                black_box(cpu.state.gpr[gpr::RAX]);
            })
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_rep_movsb(c: &mut Criterion) {
    const LEN: u64 = 32 * 1024;
    const SRC: u64 = 0x10_000;
    const DST: u64 = 0x20_000;

    let mut bus = FlatBus::new(0x30_000).unwrap();
    // rep movsb; hlt
    bus.load(0x1000, &[0xF3, 0xA4, 0xF4]).unwrap();
    let src: Vec<u8> = (0..LEN).map(|i| (i as u8).wrapping_mul(3) ^ 0x5A).collect();
    bus.load(SRC, &src).unwrap();
    let mut cpu = Processor::new(
        0,
        CpuConfig::default(),
        CpuState::new(CpuMode::Protected),
        bus.write_stamps().clone(),
    )
    .unwrap();

    let mut group = c.benchmark_group("rep_movsb");
    group.throughput(Throughput::Bytes(LEN));
    group.bench_function("32k", |b| {
        b.iter(|| {
            cpu.state.rip = 0x1000;
            cpu.state.halted = false;
            cpu.state.gpr[gpr::RSI] = SRC;
            cpu.state.gpr[gpr::RDI] = DST;
            cpu.state.gpr[gpr::RCX] = LEN;
            let exit = cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX);
            assert_eq!(exit, ExitReason::Halted);
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_trace_loop, bench_rep_movsb
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
