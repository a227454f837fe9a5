//! Recording platform used by unit tests.
//!
//! Every hook appends to an in-memory log so tests can assert on what the
//! core asked the hardware to do. Traps are already-decoded `TrapEvent`s.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{EventKind, Platform, SlotsFull, TrapEvent};
use crate::irq::queue::PendingIrq;
use crate::mem::addr::PhysAddr;
use crate::types::{CpuId, IrqId, MAX_CPUS};

#[derive(Default)]
struct Log {
    commits: Vec<(CpuId, PhysAddr, PhysAddr)>,
    enters: Vec<(CpuId, u64, u64)>,
    routes: HashMap<u32, CpuId>,
    events: Vec<(CpuId, EventKind)>,
    injected: HashMap<u32, Vec<PendingIrq>>,
    notify: HashMap<u32, bool>,
    physical_pending: Vec<IrqId>,
    mmio: HashMap<u64, u64>,
    mmio_writes: Vec<(u64, u8, u64)>,
    memory: Vec<(u64, Vec<u8>)>,
    parked: Vec<CpuId>,
    shutdown: Vec<CpuId>,
}

pub struct MockPlatform {
    log: Mutex<Log>,
    slots_per_cpu: AtomicUsize,
    relax_calls: AtomicUsize,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            log: Mutex::new(Log::default()),
            slots_per_cpu: AtomicUsize::new(4),
            relax_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_slots(&self, slots: usize) {
        self.slots_per_cpu.store(slots, Ordering::SeqCst);
    }

    /// read_phys が返すメモリを置く
    pub fn load_memory(&self, phys: u64, bytes: &[u8]) {
        self.log.lock().unwrap().memory.push((phys, bytes.to_vec()));
    }

    pub fn set_mmio(&self, phys: u64, value: u64) {
        self.log.lock().unwrap().mmio.insert(phys, value);
    }

    pub fn mmio_value(&self, phys: u64) -> Option<u64> {
        self.log.lock().unwrap().mmio.get(&phys).copied()
    }

    pub fn mmio_writes(&self) -> Vec<(u64, u8, u64)> {
        self.log.lock().unwrap().mmio_writes.clone()
    }

    pub fn commits(&self) -> Vec<(CpuId, PhysAddr, PhysAddr)> {
        self.log.lock().unwrap().commits.clone()
    }

    pub fn last_commit(&self, cpu: CpuId) -> Option<(PhysAddr, PhysAddr)> {
        self.log
            .lock()
            .unwrap()
            .commits
            .iter()
            .rev()
            .find(|(c, _, _)| *c == cpu)
            .map(|(_, s, d)| (*s, *d))
    }

    pub fn enters(&self) -> Vec<(CpuId, u64, u64)> {
        self.log.lock().unwrap().enters.clone()
    }

    pub fn route_of(&self, irq: IrqId) -> Option<CpuId> {
        self.log.lock().unwrap().routes.get(&irq.0).copied()
    }

    pub fn events_to(&self, cpu: CpuId) -> usize {
        self.log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(c, _)| *c == cpu)
            .count()
    }

    /// 注入スロットに載っている割り込み（古い順）
    pub fn injected(&self, cpu: CpuId) -> Vec<PendingIrq> {
        self.log
            .lock()
            .unwrap()
            .injected
            .get(&cpu.0)
            .cloned()
            .unwrap_or_default()
    }

    /// ゲストがスロットから取り出したことにする
    pub fn take_injected(&self, cpu: CpuId) -> Vec<PendingIrq> {
        self.log
            .lock()
            .unwrap()
            .injected
            .remove(&cpu.0)
            .unwrap_or_default()
    }

    pub fn notify_enabled(&self, cpu: CpuId) -> bool {
        self.log
            .lock()
            .unwrap()
            .notify
            .get(&cpu.0)
            .copied()
            .unwrap_or(false)
    }

    pub fn physical_pending(&self) -> Vec<IrqId> {
        self.log.lock().unwrap().physical_pending.clone()
    }

    pub fn parked(&self) -> Vec<CpuId> {
        self.log.lock().unwrap().parked.clone()
    }

    pub fn shutdown_cpus(&self) -> Vec<CpuId> {
        self.log.lock().unwrap().shutdown.clone()
    }

    pub fn relax_calls(&self) -> usize {
        self.relax_calls.load(Ordering::Relaxed)
    }
}

impl Platform for MockPlatform {
    type Trap = TrapEvent;

    fn commit_second_stage(&self, cpu: CpuId, stage2_root: PhysAddr, dma_root: PhysAddr) {
        self.log
            .lock()
            .unwrap()
            .commits
            .push((cpu, stage2_root, dma_root));
    }

    fn enter_cell(&self, cpu: CpuId, entry: u64, context: u64) {
        self.log.lock().unwrap().enters.push((cpu, entry, context));
    }

    fn route_physical_irq(&self, irq: IrqId, target: CpuId) {
        assert!(target.index() < MAX_CPUS);
        self.log.lock().unwrap().routes.insert(irq.0, target);
    }

    fn translate_trap(&self, _cpu: CpuId, trap: &TrapEvent) -> TrapEvent {
        *trap
    }

    fn send_event(&self, target: CpuId, kind: EventKind) {
        self.log.lock().unwrap().events.push((target, kind));
    }

    fn inject_irq(&self, cpu: CpuId, irq: &PendingIrq, _active: bool) -> Result<(), SlotsFull> {
        let slots = self.slots_per_cpu.load(Ordering::SeqCst);
        let mut log = self.log.lock().unwrap();
        let list = log.injected.entry(cpu.0).or_default();
        if list.len() >= slots {
            return Err(SlotsFull);
        }
        list.push(*irq);
        Ok(())
    }

    fn set_injection_notify(&self, cpu: CpuId, enabled: bool) {
        self.log.lock().unwrap().notify.insert(cpu.0, enabled);
    }

    fn set_physical_pending(&self, irq: IrqId) {
        self.log.lock().unwrap().physical_pending.push(irq);
    }

    fn mmio_read(&self, phys: PhysAddr, size: u8) -> u64 {
        let value = self.log.lock().unwrap().mmio.get(&phys.0).copied().unwrap_or(0);
        match size {
            8 => value,
            n => value & ((1u64 << (8 * n as u32)) - 1),
        }
    }

    fn mmio_write(&self, phys: PhysAddr, size: u8, value: u64) {
        let mut log = self.log.lock().unwrap();
        log.mmio_writes.push((phys.0, size, value));
        log.mmio.insert(phys.0, value);
    }

    fn read_phys(&self, phys: PhysAddr, buf: &mut [u8]) -> bool {
        let log = self.log.lock().unwrap();
        for (base, bytes) in &log.memory {
            let end = base + bytes.len() as u64;
            if phys.0 >= *base && phys.0 + buf.len() as u64 <= end {
                let start = (phys.0 - base) as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return true;
            }
        }
        false
    }

    fn park_cpu(&self, cpu: CpuId) {
        self.log.lock().unwrap().parked.push(cpu);
    }

    fn shutdown_cpu(&self, cpu: CpuId) {
        self.log.lock().unwrap().shutdown.push(cpu);
    }

    fn cpu_relax(&self) {
        self.relax_calls.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }
}
