// src/irq/mod.rs
//
// 役割:
// - 仮想割り込みの保留 → 注入 → 受理 → 完了 の流れを CPU ごとに管理する。
// - 物理割り込みの配送先（ルーティング）をセルの所有関係に合わせる。
//
// やること:
// - set_pending: (CPU, 割り込み線) ごとに Pending/Injected は高々 1 件。重複は合流させる。
// - inject_pending: 持ち主の CPU が自分のキューを吐き出す。Active なものを優先し、
//   スロットが尽きたら残りをキューへ戻して注入通知を有効にする。
// - キュー満杯は QueueFull を返すだけ。deliver_irq が物理ペンディングへ落とす（黙って捨てない）。
// - 世代番号の違うエントリ（宛先 CPU が別セルへ移った後に届いたもの）は注入しない。
//
// やらないこと:
// - 割り込みコントローラのレジスタ模倣（irqchip.rs）。
// - 優先度制御（スロットへの置き方はアーキ側の責務）。

pub mod irqchip;
pub mod queue;

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::{EventKind, Platform};
use crate::control::trace;
use crate::control::Hypervisor;
use crate::control::percpu::Stat;
use crate::error::IrqError;
use crate::logging;
use crate::types::{CellId, CpuId, CpuSet, IrqId, MAX_IRQS, MAX_PENDING_IRQS};

use queue::PendingIrq;

/// SGI / PPI（CPU ごとにバンクされる線）の上限。これ未満は全セル共通扱い
pub const FIRST_SHARED_IRQ: u32 = 32;

const PENDING: u8 = 1 << 0;
const INJECTED: u8 = 1 << 1;
const ACTIVE: u8 = 1 << 2;

/// (CPU, 割り込み線) の状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqState {
    Idle,
    Pending,
    Injected,
    Active,
    /// 処理中にもう 1 回届いた
    ActivePending,
}

/// CPU 1 つ分の割り込み線状態表
pub struct IrqStates {
    bits: [AtomicU8; MAX_IRQS],
}

impl Default for IrqStates {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqStates {
    pub const fn new() -> Self {
        IrqStates {
            bits: [const { AtomicU8::new(0) }; MAX_IRQS],
        }
    }

    pub fn get(&self, irq: IrqId) -> IrqState {
        let bits = self.bits[irq.index()].load(Ordering::Acquire);
        match (bits & ACTIVE != 0, bits & INJECTED != 0, bits & PENDING != 0) {
            (true, _, true) => IrqState::ActivePending,
            (true, _, false) => IrqState::Active,
            (false, true, _) => IrqState::Injected,
            (false, false, true) => IrqState::Pending,
            (false, false, false) => IrqState::Idle,
        }
    }

    fn is_active(&self, irq: IrqId) -> bool {
        self.bits[irq.index()].load(Ordering::Acquire) & ACTIVE != 0
    }

    /// Pending でも Injected でもなければ Pending にして true。そうでなければ合流（false）。
    fn try_mark_pending(&self, irq: IrqId) -> bool {
        self.bits[irq.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                (old & (PENDING | INJECTED) == 0).then_some(old | PENDING)
            })
            .is_ok()
    }

    fn unmark_pending(&self, irq: IrqId) {
        self.bits[irq.index()].fetch_and(!PENDING, Ordering::AcqRel);
    }

    fn mark_injected(&self, irq: IrqId) {
        let _ = self.bits[irq.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
            Some((old & !PENDING) | INJECTED)
        });
    }

    /// ゲストが受理した: Injected → Active
    fn acknowledge(&self, irq: IrqId) -> bool {
        self.bits[irq.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                (old & INJECTED != 0).then_some((old & !INJECTED) | ACTIVE)
            })
            .is_ok()
    }

    /// ゲストが完了した: Active を落とす
    fn complete(&self, irq: IrqId) -> bool {
        self.bits[irq.index()].fetch_and(!ACTIVE, Ordering::AcqRel) & ACTIVE != 0
    }

    pub fn clear_all(&self) {
        for b in &self.bits {
            b.store(0, Ordering::Release);
        }
    }
}

/// ソフトウェア生成割り込みの宛先指定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalTarget {
    /// 列挙した CPU（送り手のセル外は無視）
    Cpus(CpuSet),
    /// 送り手以外のセル内 CPU 全部
    AllOthers,
    ToSelf,
}

impl<P: Platform> Hypervisor<P> {
    fn check_irq(&self, irq: IrqId) -> Result<(), IrqError> {
        if !irq.is_valid() || irq.0 >= self.system.platform.num_irqs {
            return Err(IrqError::InvalidIrq);
        }
        Ok(())
    }

    /// 宛先 CPU のキューへ 1 件積む。すでに Pending / Injected なら合流して Ok。
    pub fn set_pending(
        &self,
        target: CpuId,
        irq: IrqId,
        sender: Option<CpuId>,
        hw: bool,
    ) -> Result<(), IrqError> {
        self.check_irq(irq)?;
        let percpu = self.percpu(target).ok_or(IrqError::InvalidIrq)?;

        if !percpu.irq_states.try_mark_pending(irq) {
            trace::trace_irq(trace::IrqEvent::Coalesced, target, irq);
            return Ok(());
        }
        let entry = PendingIrq {
            irq,
            sender,
            hw,
            generation: percpu.generation(),
        };
        if let Err(e) = percpu.pending.push(entry) {
            percpu.irq_states.unmark_pending(irq);
            return Err(e);
        }
        trace::trace_irq(trace::IrqEvent::Queued, target, irq);
        Ok(())
    }

    /// set_pending + 宛先への通知。キュー満杯なら物理ペンディングへ落とす。
    pub fn deliver_irq(&self, target: CpuId, irq: IrqId, sender: Option<CpuId>, hw: bool) {
        match self.set_pending(target, irq, sender, hw) {
            Ok(()) => self.platform.send_event(target, EventKind::Inject),
            Err(IrqError::QueueFull) => self.fallback_physical(target, irq),
            Err(_) => {
                logging::warn_hex("irq: dropped invalid delivery, irq", irq.0 as u64);
            }
        }
    }

    fn fallback_physical(&self, target: CpuId, irq: IrqId) {
        if let Some(percpu) = self.percpu(target) {
            percpu.stats.add(Stat::QueueFull);
        }
        trace::trace_irq(trace::IrqEvent::QueueFull, target, irq);
        self.platform.set_physical_pending(irq);
    }

    /// 持ち主の CPU が自分の保留キューを注入スロットへ吐き出す。
    pub fn inject_pending(&self, cpu: CpuId) {
        let Some(percpu) = self.percpu(cpu) else {
            return;
        };
        let generation = percpu.generation();

        let mut batch: [Option<PendingIrq>; MAX_PENDING_IRQS] = [None; MAX_PENDING_IRQS];
        let mut count = 0;
        while count < MAX_PENDING_IRQS {
            let Some(entry) = percpu.pending.pop() else {
                break;
            };
            if entry.generation != generation {
                percpu.irq_states.unmark_pending(entry.irq);
                trace::trace_irq(trace::IrqEvent::Stale, cpu, entry.irq);
                continue;
            }
            batch[count] = Some(entry);
            count += 1;
        }

        // 1 巡目: ゲスト内で処理中のもの / 2 巡目: それ以外
        let mut busy = false;
        for active_pass in [true, false] {
            for entry in batch[..count].iter().flatten() {
                let active = percpu.irq_states.is_active(entry.irq);
                if active != active_pass {
                    continue;
                }
                if busy {
                    self.requeue(cpu, *entry);
                    continue;
                }
                match self.platform.inject_irq(cpu, entry, active) {
                    Ok(()) => {
                        percpu.irq_states.mark_injected(entry.irq);
                        percpu.stats.add(Stat::Injected);
                        trace::trace_irq(trace::IrqEvent::Injected, cpu, entry.irq);
                    }
                    Err(_) => {
                        busy = true;
                        self.requeue(cpu, *entry);
                    }
                }
            }
        }
        self.platform.set_injection_notify(cpu, busy);
    }

    fn requeue(&self, cpu: CpuId, entry: PendingIrq) {
        let Some(percpu) = self.percpu(cpu) else {
            return;
        };
        if percpu.pending.push(entry).is_err() {
            percpu.irq_states.unmark_pending(entry.irq);
            self.fallback_physical(cpu, entry.irq);
        }
    }

    pub fn irq_state(&self, cpu: CpuId, irq: IrqId) -> Option<IrqState> {
        if self.check_irq(irq).is_err() {
            return None;
        }
        self.percpu(cpu).map(|p| p.irq_states.get(irq))
    }

    pub(crate) fn irq_acknowledged(&self, cpu: CpuId, irq: IrqId) {
        if self.check_irq(irq).is_err() {
            return;
        }
        if let Some(percpu) = self.percpu(cpu) {
            if !percpu.irq_states.acknowledge(irq) {
                logging::warn_hex("irq: ack without injection, irq", irq.0 as u64);
            }
        }
    }

    pub(crate) fn irq_completed(&self, cpu: CpuId, irq: IrqId) {
        if self.check_irq(irq).is_err() {
            return;
        }
        if let Some(percpu) = self.percpu(cpu) {
            if percpu.irq_states.complete(irq) {
                trace::trace_irq(trace::IrqEvent::Completed, cpu, irq);
            }
        }
    }

    /// 物理割り込みの配送先を変える
    pub fn route_interrupt(&self, irq: IrqId, target: CpuId) -> Result<(), IrqError> {
        self.check_irq(irq)?;
        if self.percpu(target).is_none() {
            return Err(IrqError::InvalidIrq);
        }
        self.platform.route_physical_irq(irq, target);
        trace::trace_irq(trace::IrqEvent::Routed, target, irq);
        Ok(())
    }

    /// セルが所有する共有割り込み線をすべて、そのセルの先頭 CPU へ向ける
    pub(crate) fn route_cell_irqs(&self, cell: CellId) {
        let (irqs, first) = {
            let slot = self.cells[cell.index()].read();
            let Some(c) = slot.as_ref() else {
                return;
            };
            (c.irqs, c.cpus.first())
        };
        let Some(first) = first else {
            return;
        };
        for irq in irqs.iter().filter(|i| i.0 >= FIRST_SHARED_IRQ) {
            if self.route_interrupt(irq, first).is_err() {
                logging::warn_hex("irq: cannot route irq", irq.0 as u64);
            }
        }
    }

    /// ソフトウェア生成割り込みを同じセル内の CPU へ送る。送った数を返す。
    pub fn cell_signal(
        &self,
        sender: CpuId,
        irq: IrqId,
        target: SignalTarget,
    ) -> Result<usize, IrqError> {
        self.check_irq(irq)?;
        let cell = self.percpu(sender).ok_or(IrqError::InvalidIrq)?.cell();
        let cell_cpus = self.cell_cpus(cell);
        if !cell_cpus.contains(sender) {
            return Err(IrqError::NotOwned);
        }

        let targets = match target {
            SignalTarget::Cpus(set) => CpuSet::from_bits(set.bits() & cell_cpus.bits()),
            SignalTarget::AllOthers => cell_cpus.difference(CpuSet::single(sender)),
            SignalTarget::ToSelf => CpuSet::single(sender),
        };
        for cpu in targets.iter() {
            self.deliver_irq(cpu, irq, Some(sender), false);
        }
        Ok(targets.len())
    }

    /// 物理割り込みがこの CPU に届いた
    pub(crate) fn handle_physical_irq(&self, cpu: CpuId, irq: IrqId) {
        if irq.0 == self.system.platform.maintenance_irq {
            return;
        }
        let Some(percpu) = self.percpu(cpu) else {
            return;
        };
        let cell = percpu.cell();
        if irq.0 < FIRST_SHARED_IRQ || self.cell_owns_irq(cell, irq) {
            match self.set_pending(cpu, irq, None, true) {
                Ok(()) => {}
                Err(IrqError::QueueFull) => self.fallback_physical(cpu, irq),
                Err(_) => logging::warn_hex("irq: invalid physical irq", irq.0 as u64),
            }
            return;
        }

        // 所有セルの CPU へ向け直し、物理側で再度保留にする
        logging::warn_hex("irq: misrouted physical irq", irq.0 as u64);
        if let Some(owner) = self.irq_owner(irq) {
            if let Some(first) = self.cell_cpus(owner).first() {
                let _ = self.route_interrupt(irq, first);
            }
        }
        self.platform.set_physical_pending(irq);
    }

    pub fn cell_owns_irq(&self, cell: CellId, irq: IrqId) -> bool {
        self.cells[cell.index()]
            .read()
            .as_ref()
            .is_some_and(|c| c.irqs.contains(irq))
    }

    fn irq_owner(&self, irq: IrqId) -> Option<CellId> {
        self.live_cells().find(|id| self.cell_owns_irq(*id, irq))
    }
}

#[cfg(test)]
mod irq_test;
