#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use trex_cpu::{CpuConfig, CpuMode, CpuState, ExitOnEvent, ExitReason, FlatBus};
use trex_smp::{Machine, SchedulerConfig};

proptest! {
    /// Time moves forward every round by the busiest processor's count, and never by zero.
    #[test]
    fn ticks_always_advance(
        spinning in prop::collection::vec(any::<bool>(), 1..5),
        rounds in 1usize..12,
    ) {
        let mut bus = FlatBus::new(0x10000).unwrap();
        let mut states = Vec::new();
        for (i, spins) in spinning.iter().enumerate() {
            let rip = 0x1000 * (i as u64 + 1);
            // jmp $ or hlt
            let code: &[u8] = if *spins { &[0xEB, 0xFE] } else { &[0xF4] };
            bus.load(rip, code).unwrap();
            let mut state = CpuState::new(CpuMode::Protected);
            state.rip = rip;
            states.push(state);
        }
        let config = SchedulerConfig {
            uniprocessor_quantum: 64,
            cpu: CpuConfig {
                trace_slots: 1024,
                record_pool: 4096,
                ..CpuConfig::default()
            },
            ..SchedulerConfig::default()
        };
        let quantum = if spinning.len() > 1 { 16 } else { 64 };
        let mut m = Machine::new(config, bus, ExitOnEvent, states).unwrap();

        for _ in 0..rounds {
            let before = m.ticks();
            let report = m.run_round();
            let busiest = report.exits.iter().map(|e| e.executed).max().unwrap_or(0);
            prop_assert!(report.ticks_advanced >= 1);
            prop_assert_eq!(report.ticks_advanced, busiest.max(1));
            prop_assert_eq!(m.ticks(), before + report.ticks_advanced);

            for (exit, spins) in report.exits.iter().zip(&spinning) {
                if *spins {
                    prop_assert_eq!(&exit.exit, &ExitReason::QuantumExhausted);
                    prop_assert_eq!(exit.executed, quantum);
                } else {
                    prop_assert_eq!(&exit.exit, &ExitReason::Halted);
                }
            }
        }
    }
}
