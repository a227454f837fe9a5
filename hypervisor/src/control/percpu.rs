// src/control/percpu.rs
//
// 役割:
// - 物理 CPU 1 つ分の制御ブロックと、その状態機械。
//
// 状態:
//   Offline → Active（起動時）
//   Active / Parked → SuspendRequested → Suspended（対象 CPU 自身が遷移する）
//   Suspended → (resume) 元の状態 / (reset) Active / (park) Parked / (shutdown) ShuttingDown
//   有限回待っても Suspended に来ない CPU は Failed（以後の管理操作から外す）
//
// 約束:
// - 要求を出すのは管理側、遷移を実行するのは対象 CPU 自身（handle_events の中）。
// - Suspended を観測した CPU は、管理側の resume / reset 以外では再開しない。
// - 管理側は cpu_relax しながら有限回だけ待つ（無限に待たない）。
// - handle_events はブロックしない。待つべき時は Wait / Park を返し、アーキ側のループに任せる。

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::{CpuAction, EventKind, Platform};
use crate::control::trace;
use crate::control::Hypervisor;
use crate::error::{ControlError, HvError};
use crate::irq::queue::{next_generation, PendingQueue};
use crate::irq::IrqStates;
use crate::logging;
use crate::types::{CellId, CpuId, CpuSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Offline,
    Active,
    SuspendRequested,
    Suspended,
    Parked,
    ShuttingDown,
    Failed,
}

/// CPU ごとの統計カウンタ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stat {
    VmexitsTotal = 0,
    Mmio = 1,
    Management = 2,
    Hypercall = 3,
    Injected = 4,
    QueueFull = 5,
}

pub const NUM_STATS: usize = 6;

pub struct CpuStats {
    counters: [AtomicU64; NUM_STATS],
}

impl CpuStats {
    const fn new() -> Self {
        CpuStats {
            counters: [const { AtomicU64::new(0) }; NUM_STATS],
        }
    }

    pub fn add(&self, stat: Stat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.counters.get(index).map(|c| c.load(Ordering::Relaxed))
    }
}

struct Control {
    state: CpuState,
    /// suspend が解けたときに戻る状態（Active / Parked）
    resume_to: CpuState,
    cell: CellId,
    suspend_requested: bool,
    reset_requested: bool,
    park_requested: bool,
    shutdown_requested: bool,
    /// 所属セルのテーブルが変わったので次の再開で commit し直す
    flush_requested: bool,
    entry: u64,
    context: u64,
    /// ポリシー違反で止めた
    failed: bool,
}

pub struct PerCpu {
    pub id: CpuId,
    control: Mutex<Control>,
    /// 所属が変わるたびに進める（古い割り込みの識別用）
    generation: AtomicU32,
    pub pending: PendingQueue,
    pub irq_states: IrqStates,
    pub stats: CpuStats,
}

impl PerCpu {
    pub fn new(id: CpuId) -> Self {
        PerCpu {
            id,
            control: Mutex::new(Control {
                state: CpuState::Offline,
                resume_to: CpuState::Active,
                cell: CellId::ROOT,
                suspend_requested: false,
                reset_requested: false,
                park_requested: false,
                shutdown_requested: false,
                flush_requested: false,
                entry: 0,
                context: 0,
                failed: false,
            }),
            generation: AtomicU32::new(0),
            pending: PendingQueue::new(),
            irq_states: IrqStates::new(),
            stats: CpuStats::new(),
        }
    }

    pub fn state(&self) -> CpuState {
        self.control.lock().state
    }

    pub fn cell(&self) -> CellId {
        self.control.lock().cell
    }

    /// Failed（無応答）またはポリシー違反で止められた
    pub fn is_failed(&self) -> bool {
        let c = self.control.lock();
        c.failed || c.state == CpuState::Failed
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// 所属が変わった: 世代を進め、前の所属の割り込みを全部捨てる
    fn start_new_generation(&self) {
        let next = next_generation(self.generation.load(Ordering::Acquire));
        self.generation.store(next, Ordering::Release);
        self.pending.clear();
        self.irq_states.clear_all();
    }

    fn transition(&self, c: &mut Control, to: CpuState) {
        trace::trace_cpu(self.id, c.state, to);
        c.state = to;
    }

    pub(crate) fn boot(&self, cell: CellId) -> Result<(), ControlError> {
        let mut c = self.control.lock();
        if c.state != CpuState::Offline {
            return Err(ControlError::InvalidState);
        }
        c.cell = cell;
        self.transition(&mut c, CpuState::Active);
        drop(c);
        self.start_new_generation();
        Ok(())
    }

    /// suspend 要求を立てる。戻り値は「通知を送る必要があるか」。
    fn request_suspend(&self) -> Result<bool, ControlError> {
        let mut c = self.control.lock();
        match c.state {
            CpuState::Active | CpuState::Parked => {
                c.resume_to = c.state;
                c.suspend_requested = true;
                self.transition(&mut c, CpuState::SuspendRequested);
                Ok(true)
            }
            CpuState::SuspendRequested | CpuState::Suspended => {
                c.suspend_requested = true;
                Ok(false)
            }
            CpuState::Failed => Err(ControlError::CpuFailed),
            CpuState::Offline | CpuState::ShuttingDown => Err(ControlError::InvalidState),
        }
    }

    fn is_suspended(&self) -> bool {
        self.control.lock().state == CpuState::Suspended
    }

    /// 待ち切れなかった。最後にもう一度だけ見て、まだなら Failed に落とす。
    fn give_up_waiting(&self) -> bool {
        let mut c = self.control.lock();
        if c.state == CpuState::Suspended {
            return false;
        }
        c.suspend_requested = false;
        self.transition(&mut c, CpuState::Failed);
        true
    }

    fn resume(&self) {
        let mut c = self.control.lock();
        c.suspend_requested = false;
    }

    fn with_suspended<R>(&self, f: impl FnOnce(&mut Control) -> R) -> Result<R, ControlError> {
        let mut c = self.control.lock();
        if c.state != CpuState::Suspended {
            return Err(ControlError::InvalidState);
        }
        Ok(f(&mut c))
    }

    /// 所属を移す。Failed の CPU は止まったまま所属だけ移る（セル破棄時）。
    pub(crate) fn assign(&self, cell: CellId) -> Result<(), ControlError> {
        let mut c = self.control.lock();
        match c.state {
            CpuState::Suspended | CpuState::Failed => {
                c.cell = cell;
                Ok(())
            }
            _ => Err(ControlError::InvalidState),
        }
    }

    pub(crate) fn request_reset(&self, entry: u64, context: u64) -> Result<(), ControlError> {
        self.with_suspended(|c| {
            c.reset_requested = true;
            c.park_requested = false;
            c.entry = entry;
            c.context = context;
        })
    }

    pub(crate) fn request_park(&self) -> Result<(), ControlError> {
        self.with_suspended(|c| {
            c.park_requested = true;
            c.reset_requested = false;
        })
    }

    pub(crate) fn request_shutdown(&self) -> Result<(), ControlError> {
        self.with_suspended(|c| c.shutdown_requested = true)
    }

    pub(crate) fn request_flush(&self) {
        self.control.lock().flush_requested = true;
    }

    /// 自分自身のシャットダウン（ハイパーコールを発行した CPU 用）
    pub(crate) fn shutdown_self(&self) {
        self.control.lock().shutdown_requested = true;
    }

    /// ポリシー違反: この CPU 自身が Parked へ落ちる。
    ///
    /// 遷移は handle_events の park 経路で行う。suspend 要求が出ていれば先に
    /// Suspended まで進み、resume の後で Parked に入る。
    pub(crate) fn fail_self(&self) {
        let mut c = self.control.lock();
        c.failed = true;
        c.park_requested = true;
        c.reset_requested = false;
    }
}

/// handle_events が対象 CPU 上で行うべき後処理
enum Pending {
    None,
    Commit,
    Enter { entry: u64, context: u64 },
    Park,
    Shutdown,
}

impl<P: Platform> Hypervisor<P> {
    /// 1 CPU を suspend する（要求 → 通知 → 有限回待ち）。
    pub fn suspend_cpu(&self, cpu: CpuId) -> Result<(), HvError> {
        let percpu = self.percpu(cpu).ok_or(ControlError::InvalidCpu)?;
        if percpu.request_suspend()? {
            self.platform.send_event(cpu, EventKind::Management);
        }
        self.wait_suspended(percpu)
    }

    fn wait_suspended(&self, percpu: &PerCpu) -> Result<(), HvError> {
        for _ in 0..self.tunables.suspend_retries {
            if percpu.is_suspended() {
                return Ok(());
            }
            self.platform.cpu_relax();
        }
        if percpu.give_up_waiting() {
            logging::error("cpu: did not reach Suspended, marking Failed");
            logging::info_u64(" cpu", percpu.id.0 as u64);
            return Err(ControlError::Unresponsive.into());
        }
        Ok(())
    }

    /// CPU 集合をまとめて suspend する（Failed の CPU は飛ばす）。
    ///
    /// 全員が Suspended になったら、実際に止めた集合を返す。
    /// 途中で失敗したら、止めた分を再開してから失敗を返す。
    pub fn suspend_cpus(&self, cpus: CpuSet, except: Option<CpuId>) -> Result<CpuSet, HvError> {
        let mut requested = CpuSet::EMPTY;
        let mut result = Ok(());
        for cpu in cpus.iter() {
            if Some(cpu) == except {
                continue;
            }
            let Some(percpu) = self.percpu(cpu) else {
                continue;
            };
            match percpu.request_suspend() {
                Ok(kick) => {
                    requested.insert(cpu);
                    if kick {
                        self.platform.send_event(cpu, EventKind::Management);
                    }
                }
                Err(ControlError::CpuFailed) => {}
                Err(e) => {
                    result = Err(HvError::from(e));
                    break;
                }
            }
        }

        if result.is_ok() {
            for cpu in requested.iter() {
                if let Some(percpu) = self.percpu(cpu) {
                    if let Err(e) = self.wait_suspended(percpu) {
                        requested.remove(cpu);
                        result = Err(e);
                    }
                }
            }
        }

        match result {
            Ok(()) => Ok(requested),
            Err(e) => {
                self.resume_cpus(requested);
                Err(e)
            }
        }
    }

    /// suspend を解く。Suspended でなければ何もしない。
    pub fn resume_cpu(&self, cpu: CpuId) {
        if let Some(percpu) = self.percpu(cpu) {
            percpu.resume();
            self.platform.send_event(cpu, EventKind::Management);
        }
    }

    pub fn resume_cpus(&self, cpus: CpuSet) {
        for cpu in cpus.iter() {
            self.resume_cpu(cpu);
        }
    }

    /// Suspended の CPU に、次の再開時にレジスタを作り直してセルへ入るよう指示する。
    pub fn reset_cpu(&self, cpu: CpuId, entry: u64, context: u64) -> Result<(), HvError> {
        let percpu = self.percpu(cpu).ok_or(ControlError::InvalidCpu)?;
        percpu.request_reset(entry, context)?;
        Ok(())
    }

    /// Suspended の CPU に、次の再開時に Parked へ入るよう指示する。
    pub fn park_cpu(&self, cpu: CpuId) -> Result<(), HvError> {
        let percpu = self.percpu(cpu).ok_or(ControlError::InvalidCpu)?;
        percpu.request_park()?;
        Ok(())
    }

    pub fn shutdown_cpu(&self, cpu: CpuId) -> Result<(), HvError> {
        let percpu = self.percpu(cpu).ok_or(ControlError::InvalidCpu)?;
        percpu.request_shutdown()?;
        Ok(())
    }

    pub fn cpu_state(&self, cpu: CpuId) -> Option<CpuState> {
        self.percpu(cpu).map(|p| p.state())
    }

    /// 対象 CPU 自身が呼ぶ。溜まっている要求を処理し、次にとるべき行動を返す。
    pub fn handle_events(&self, cpu: CpuId) -> CpuAction {
        let Some(percpu) = self.percpu(cpu) else {
            return CpuAction::Park;
        };

        let (pending, cell, action) = {
            let mut c = percpu.control.lock();
            match c.state {
                CpuState::Failed => return CpuAction::Park,
                CpuState::ShuttingDown => return CpuAction::Shutdown,
                CpuState::Offline => return CpuAction::Park,
                _ => {}
            }

            if c.suspend_requested {
                if c.state == CpuState::SuspendRequested {
                    percpu.transition(&mut c, CpuState::Suspended);
                }
                return CpuAction::Wait;
            }

            let mut pending = Pending::None;
            if c.shutdown_requested {
                c.shutdown_requested = false;
                percpu.transition(&mut c, CpuState::ShuttingDown);
                pending = Pending::Shutdown;
            } else if matches!(c.state, CpuState::Suspended | CpuState::SuspendRequested) {
                if c.park_requested {
                    c.park_requested = false;
                    c.flush_requested = false;
                    percpu.transition(&mut c, CpuState::Parked);
                    pending = Pending::Park;
                } else if c.reset_requested {
                    c.reset_requested = false;
                    c.flush_requested = false;
                    c.failed = false;
                    percpu.transition(&mut c, CpuState::Active);
                    pending = Pending::Enter {
                        entry: c.entry,
                        context: c.context,
                    };
                } else {
                    let to = c.resume_to;
                    percpu.transition(&mut c, to);
                }
            } else if c.park_requested && c.state == CpuState::Active {
                c.park_requested = false;
                c.flush_requested = false;
                percpu.transition(&mut c, CpuState::Parked);
                pending = Pending::Park;
            }
            if matches!(pending, Pending::None) && c.flush_requested && c.state == CpuState::Active {
                c.flush_requested = false;
                pending = Pending::Commit;
            }

            let action = match c.state {
                CpuState::Parked => CpuAction::Park,
                _ => CpuAction::Resume(None),
            };
            (pending, c.cell, action)
        };

        match pending {
            Pending::None => action,
            Pending::Commit => {
                self.commit_cell_tables(cpu, cell);
                action
            }
            Pending::Enter { entry, context } => {
                percpu.start_new_generation();
                self.commit_cell_tables(cpu, cell);
                self.platform.enter_cell(cpu, entry, context);
                CpuAction::Enter
            }
            Pending::Park => {
                percpu.start_new_generation();
                self.platform.park_cpu(cpu);
                CpuAction::Park
            }
            Pending::Shutdown => {
                self.platform.shutdown_cpu(cpu);
                CpuAction::Shutdown
            }
        }
    }

    pub(crate) fn commit_cell_tables(&self, cpu: CpuId, cell: CellId) {
        let roots = self.cells[cell.index()]
            .read()
            .as_ref()
            .map(|c| (c.memory.stage2_root(), c.memory.dma_root()));
        match roots {
            Some((stage2, dma)) => self.platform.commit_second_stage(cpu, stage2, dma),
            None => logging::error("INVARIANT VIOLATION: cpu assigned to a missing cell"),
        }
    }
}

#[cfg(test)]
#[path = "percpu_test.rs"]
mod percpu_test;
