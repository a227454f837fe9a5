// src/control/entry.rs
//
// アーキ側から呼ばれる入口。
// - on_cpu_boot: 前のカーネルから CPU を引き継ぐとき、CPU ごとに 1 回。
// - on_trap:     セルからハイパーバイザへ戻るたび（VM exit ごと）。
// - on_wake:     Wait / Park から起こされたとき。
//
// どの入口も最後に handle_events を通し、セルへ戻る直前に保留割り込みを注入する。
// ポリシー違反（どこにも当たらない MMIO 等）はそのセルだけを止める。

use crate::arch::{CpuAction, Platform, TrapEvent};
use crate::control::comm::CommState;
use crate::control::percpu::Stat;
use crate::control::Hypervisor;
use crate::error::{ControlError, HvError};
use crate::logging;
use crate::mmio::MmioResult;
use crate::types::{CellId, CpuId};

impl<P: Platform> Hypervisor<P> {
    pub fn on_cpu_boot(&self, cpu: CpuId) -> Result<(), HvError> {
        let percpu = self.percpu(cpu).ok_or(ControlError::InvalidCpu)?;
        if !self.cell_cpus(CellId::ROOT).contains(cpu) {
            logging::warn_hex("cpu: boot of a cpu outside the root cell", cpu.0 as u64);
            return Err(HvError::InvalidArgument);
        }
        percpu.boot(CellId::ROOT)?;
        self.commit_cell_tables(cpu, CellId::ROOT);
        logging::info_u64("cpu: online", cpu.0 as u64);
        Ok(())
    }

    pub fn on_trap(&self, cpu: CpuId, trap: &P::Trap) -> CpuAction {
        let Some(percpu) = self.percpu(cpu) else {
            return CpuAction::Park;
        };
        percpu.stats.add(Stat::VmexitsTotal);

        let mut value = None;
        match self.platform.translate_trap(cpu, trap) {
            TrapEvent::Mmio(access) => match self.handle_mmio(cpu, &access) {
                MmioResult::Handled(v) => value = v,
                MmioResult::Unhandled | MmioResult::Error => {
                    logging::warn_hex("cell: invalid mmio access", access.address);
                    self.policy_violation(cpu);
                }
            },
            TrapEvent::Hypercall { code, arg1, arg2 } => {
                percpu.stats.add(Stat::Hypercall);
                value = Some(self.hypercall(cpu, code, arg1, arg2) as u64);
            }
            TrapEvent::Management => percpu.stats.add(Stat::Management),
            TrapEvent::InjectKick | TrapEvent::Maintenance => {}
            TrapEvent::PhysicalIrq(irq) => self.handle_physical_irq(cpu, irq),
            TrapEvent::IrqAck(irq) => self.irq_acknowledged(cpu, irq),
            TrapEvent::IrqEoi(irq) => self.irq_completed(cpu, irq),
            TrapEvent::Unknown(reason) => {
                logging::warn_hex("cell: unhandled exit reason", reason);
                self.policy_violation(cpu);
            }
        }

        match self.on_wake(cpu) {
            CpuAction::Resume(_) => CpuAction::Resume(value),
            other => other,
        }
    }

    pub fn on_wake(&self, cpu: CpuId) -> CpuAction {
        let action = self.handle_events(cpu);
        if matches!(action, CpuAction::Resume(_) | CpuAction::Enter) {
            self.inject_pending(cpu);
        }
        action
    }

    /// 違反した CPU だけを止める。セルの CPU が全部止まったらセルを FAILED にする。
    fn policy_violation(&self, cpu: CpuId) {
        let Some(percpu) = self.percpu(cpu) else {
            return;
        };
        percpu.fail_self();
        let cell = percpu.cell();
        logging::error("cell: policy violation, cpu parked");
        logging::info_u64(" cpu", cpu.0 as u64);
        logging::info_u64(" cell", cell.0 as u64);

        if cell.is_root() {
            logging::error("cell: root cell cpu parked after a violation");
            return;
        }
        let all_failed = self
            .cell_cpus(cell)
            .iter()
            .all(|c| self.percpu(c).is_some_and(|p| p.is_failed()));
        if all_failed {
            self.set_comm_state(cell, CommState::Failed);
        }
    }
}
