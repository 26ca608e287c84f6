use std::sync::Arc;

use trex_cpu::bus::{CodePage, FlatBus};
use trex_cpu::{
    gpr, AccessKind, CpuBus, CpuConfig, CpuMode, CpuState, EventLine, ExitOnEvent, ExitReason,
    NoGuard, PageFault, PendingEvents, Processor, RFlags,
};
use trex_mem::{GuestMemoryResult, WriteStampTable};

const SRC: u64 = 0x4000;
const DST: u64 = 0x8000;

/// Raises an interrupt on the processor once the `raise_after`-th store into the destination
/// page lands.
struct InterruptingBus {
    inner: FlatBus,
    line: Option<Arc<EventLine>>,
    raise_after: usize,
    writes: usize,
}

impl InterruptingBus {
    fn new(raise_after: usize) -> Self {
        Self {
            inner: FlatBus::new(0x10000).unwrap(),
            line: None,
            raise_after,
            writes: 0,
        }
    }
}

impl CpuBus for InterruptingBus {
    fn translate(&mut self, linear: u64, access: AccessKind, cpl: u8) -> Result<u64, PageFault> {
        self.inner.translate(linear, access, cpl)
    }

    fn code_page(&self, paddr: u64) -> Option<CodePage<'_>> {
        self.inner.code_page(paddr)
    }

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.inner.read_phys(paddr, dst)
    }

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        if (DST..DST + 0x1000).contains(&paddr) {
            self.writes += 1;
            if self.writes == self.raise_after {
                if let Some(line) = &self.line {
                    line.raise(PendingEvents::INTERRUPT);
                }
            }
        }
        self.inner.write_phys(paddr, src)
    }

    fn write_stamps(&self) -> &Arc<WriteStampTable> {
        self.inner.write_stamps()
    }
}

fn processor(stamps: &Arc<WriteStampTable>, rep_event_interval: u32) -> Processor {
    let mut state = CpuState::new(CpuMode::Protected);
    state.rip = 0x1000;
    let config = CpuConfig {
        trace_slots: 1024,
        record_pool: 4096,
        rep_event_interval,
        ..CpuConfig::default()
    };
    Processor::new(0, config, state, stamps.clone()).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn copy_setup(raise_after: usize, interval: u32) -> (Processor, InterruptingBus, Vec<u8>) {
    let mut bus = InterruptingBus::new(raise_after);
    // rep movsb; hlt
    bus.inner.load(0x1000, &[0xF3, 0xA4, 0xF4]).unwrap();
    let data = pattern(1000);
    bus.inner.load(SRC, &data).unwrap();

    let mut cpu = processor(bus.write_stamps(), interval);
    bus.line = Some(cpu.events().clone());
    cpu.state.gpr[gpr::RSI] = SRC;
    cpu.state.gpr[gpr::RDI] = DST;
    cpu.state.gpr[gpr::RCX] = 1000;
    (cpu, bus, data)
}

fn read(bus: &InterruptingBus, paddr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    bus.inner.memory().read_into(paddr, &mut buf).unwrap();
    buf
}

#[test]
fn interrupted_rep_movsb_resumes_with_remaining_count() {
    let (mut cpu, mut bus, data) = copy_setup(400, 1);

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::AsyncEvent);
    assert_eq!(cpu.state.rip, 0x1000);
    assert_eq!(cpu.state.gpr[gpr::RCX], 600);
    assert_eq!(cpu.state.gpr[gpr::RSI], SRC + 400);
    assert_eq!(cpu.state.gpr[gpr::RDI], DST + 400);
    assert_eq!(cpu.icount(), 400);

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.state.gpr[gpr::RCX], 0);
    assert_eq!(bus.writes, 1000);
    assert_eq!(read(&bus, DST, 1000), data);
    // 1000 iterations plus the hlt.
    assert_eq!(cpu.icount(), 1001);
}

#[test]
fn rep_polls_for_events_every_interval() {
    let (mut cpu, mut bus, _) = copy_setup(400, 31);

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::AsyncEvent);
    // First poll at or after the 400th iteration.
    assert_eq!(cpu.state.gpr[gpr::RCX], 1000 - 403);
}

#[test]
fn rep_yields_when_quantum_runs_out() {
    let mut bus = InterruptingBus::new(0);
    // rep stosb; hlt
    bus.inner.load(0x1000, &[0xF3, 0xAA, 0xF4]).unwrap();
    let mut cpu = processor(bus.write_stamps(), 31);
    cpu.state.gpr[gpr::RAX] = 0xAB;
    cpu.state.gpr[gpr::RDI] = DST;
    cpu.state.gpr[gpr::RCX] = 1000;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, 50), ExitReason::QuantumExhausted);
    assert_eq!(cpu.state.gpr[gpr::RCX], 1000 - 62);
    assert_eq!(cpu.icount(), 62);
    assert_eq!(cpu.state.rip, 0x1000);

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.icount(), 1001);
    assert_eq!(read(&bus, DST, 1000), vec![0xAB; 1000]);
}

#[test]
fn repe_cmpsb_stops_at_first_mismatch() {
    let mut bus = InterruptingBus::new(0);
    // repe cmpsb; hlt
    bus.inner.load(0x1000, &[0xF3, 0xA6, 0xF4]).unwrap();
    bus.inner.load(SRC, b"hello world").unwrap();
    bus.inner.load(DST, b"hello_world").unwrap();
    let mut cpu = processor(bus.write_stamps(), 31);
    cpu.state.gpr[gpr::RSI] = SRC;
    cpu.state.gpr[gpr::RDI] = DST;
    cpu.state.gpr[gpr::RCX] = 11;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.state.gpr[gpr::RCX], 5);
    assert_eq!(cpu.state.gpr[gpr::RSI], SRC + 6);
    assert!(!cpu.state.zf());
}

#[test]
fn repne_scasb_finds_terminator() {
    let mut bus = InterruptingBus::new(0);
    // repne scasb; hlt
    bus.inner.load(0x1000, &[0xF2, 0xAE, 0xF4]).unwrap();
    bus.inner.load(DST, b"abc\0").unwrap();
    let mut cpu = processor(bus.write_stamps(), 31);
    cpu.state.gpr[gpr::RDI] = DST;
    cpu.state.gpr[gpr::RCX] = 100;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.state.gpr[gpr::RCX], 96);
    assert_eq!(cpu.state.gpr[gpr::RDI], DST + 4);
    assert!(cpu.state.zf());
}

#[test]
fn sixteen_bit_addressing_counts_with_cx_only() {
    let mut bus = InterruptingBus::new(0);
    // a16 rep stosd; hlt
    bus.inner.load(0x1000, &[0x67, 0xF3, 0xAB, 0xF4]).unwrap();
    let mut cpu = processor(bus.write_stamps(), 31);
    cpu.state.gpr[gpr::RAX] = 0xDEAD_BEEF;
    cpu.state.gpr[gpr::RDI] = 0x1234_0000 | DST;
    cpu.state.gpr[gpr::RCX] = 0xABCD_0003;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.state.gpr[gpr::RCX], 0xABCD_0000);
    assert_eq!(cpu.state.gpr[gpr::RDI], 0x1234_0000 | (DST + 12));
    assert_eq!(read(&bus, DST, 12), [0xEFu8, 0xBE, 0xAD, 0xDE].repeat(3));
}

#[test]
fn zero_count_touches_nothing() {
    let (mut cpu, mut bus, _) = copy_setup(usize::MAX, 31);
    cpu.state.gpr[gpr::RCX] = 0;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(bus.writes, 0);
    assert_eq!(cpu.state.gpr[gpr::RSI], SRC);
    assert_eq!(cpu.icount(), 2);
}

#[test]
fn direction_flag_copies_downwards() {
    let (mut cpu, mut bus, data) = copy_setup(usize::MAX, 31);
    cpu.state.rflags.insert(RFlags::DF);
    cpu.state.gpr[gpr::RSI] = SRC + 3;
    cpu.state.gpr[gpr::RDI] = DST + 3;
    cpu.state.gpr[gpr::RCX] = 4;

    assert_eq!(cpu.run(&mut bus, &mut ExitOnEvent, &mut NoGuard, u64::MAX), ExitReason::Halted);
    assert_eq!(cpu.state.gpr[gpr::RSI], SRC - 1);
    assert_eq!(cpu.state.gpr[gpr::RDI], DST - 1);
    assert_eq!(read(&bus, DST, 4), data[..4]);
}
