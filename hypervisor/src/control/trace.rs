// src/control/trace.rs
//
// 低コスト trace をホットパスから 1 箇所に集約する。
// - CPU 状態遷移（percpu.rs）
// - 割り込みの経路（queued / coalesced / queue_full / stale / injected / completed / routed）
// - トラップされた MMIO アクセス
//
// 設計方針:
// - logging 側に新 API を要求しない（info / info_u64 / info_hex のみ）
// - no_std 前提で heap 確保なし（固定文字列 + u64）
// - feature off のときは #[inline(always)] の空関数になり、呼び出しごと消える
//
// feature:
// - trace_cpu:  CPU 状態遷移
// - trace_irq:  割り込み経路
// - trace_mmio: MMIO トラップ

use crate::control::percpu::CpuState;
use crate::types::{CpuId, IrqId};

// IrqEvent は feature off でも存在させる（呼び出し側を cfg で汚さない）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqEvent {
    Coalesced,
    Queued,
    QueueFull,
    Stale,
    Injected,
    Completed,
    Routed,
}

#[cfg(feature = "trace_cpu")]
fn state_name(state: CpuState) -> &'static str {
    match state {
        CpuState::Offline => "offline",
        CpuState::Active => "active",
        CpuState::SuspendRequested => "suspend_requested",
        CpuState::Suspended => "suspended",
        CpuState::Parked => "parked",
        CpuState::ShuttingDown => "shutting_down",
        CpuState::Failed => "failed",
    }
}

#[inline(always)]
pub fn trace_cpu(cpu: CpuId, from: CpuState, to: CpuState) {
    #[cfg(feature = "trace_cpu")]
    {
        crate::logging::info_u64("cpu_trace cpu", cpu.0 as u64);
        crate::logging::info(state_name(from));
        crate::logging::info(state_name(to));
    }
    #[cfg(not(feature = "trace_cpu"))]
    {
        let _ = cpu;
        let _ = from;
        let _ = to;
    }
}

#[inline(always)]
pub fn trace_irq(ev: IrqEvent, cpu: CpuId, irq: IrqId) {
    #[cfg(feature = "trace_irq")]
    {
        match ev {
            IrqEvent::Coalesced => crate::logging::info("irq_trace path=coalesced"),
            IrqEvent::Queued => crate::logging::info("irq_trace path=queued"),
            IrqEvent::QueueFull => crate::logging::info("irq_trace path=queue_full"),
            IrqEvent::Stale => crate::logging::info("irq_trace path=stale"),
            IrqEvent::Injected => crate::logging::info("irq_trace path=injected"),
            IrqEvent::Completed => crate::logging::info("irq_trace path=completed"),
            IrqEvent::Routed => crate::logging::info("irq_trace path=routed"),
        }
        crate::logging::info_u64("cpu", cpu.0 as u64);
        crate::logging::info_u64("irq", irq.0 as u64);
    }
    #[cfg(not(feature = "trace_irq"))]
    {
        let _ = ev;
        let _ = cpu;
        let _ = irq;
    }
}

#[inline(always)]
pub fn trace_mmio(cpu: CpuId, address: u64, size: u8, is_write: bool) {
    #[cfg(feature = "trace_mmio")]
    {
        if is_write {
            crate::logging::info_hex("mmio_trace write", address);
        } else {
            crate::logging::info_hex("mmio_trace read", address);
        }
        crate::logging::info_u64("cpu", cpu.0 as u64);
        crate::logging::info_u64("size", size as u64);
    }
    #[cfg(not(feature = "trace_mmio"))]
    {
        let _ = cpu;
        let _ = address;
        let _ = size;
        let _ = is_write;
    }
}
