//! Tests for queueing, coalescing, injection order and routing of virtual interrupts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::irq::queue::next_generation;
use crate::test_support::{boot_hypervisor, root_cell, test_tunables};

const CPU0: CpuId = CpuId(0);
const CPU1: CpuId = CpuId(1);

#[test]
fn queue_rejects_the_entry_past_capacity_and_keeps_the_rest() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let capacity = MAX_PENDING_IRQS as u32;

    for n in 0..capacity {
        hv.set_pending(CPU1, IrqId(32 + n), None, false).unwrap();
    }
    assert_eq!(
        hv.set_pending(CPU1, IrqId(32 + capacity), None, false),
        Err(IrqError::QueueFull)
    );
    // 溢れた線は Pending のまま残らない
    assert_eq!(hv.irq_state(CPU1, IrqId(32 + capacity)), Some(IrqState::Idle));

    let queue = &hv.percpu(CPU1).unwrap().pending;
    let mut drained = 0;
    while queue.pop().is_some() {
        drained += 1;
    }
    assert_eq!(drained, capacity);
}

#[test]
fn repeated_pending_coalesces_into_one_entry() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    hv.set_pending(CPU1, IrqId(40), None, true).unwrap();
    hv.set_pending(CPU1, IrqId(40), None, true).unwrap();
    assert_eq!(hv.percpu(CPU1).unwrap().pending.len(), 1);
    assert_eq!(hv.irq_state(CPU1, IrqId(40)), Some(IrqState::Pending));
}

#[test]
fn injected_irq_walks_through_active_back_to_idle() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    hv.set_pending(CPU1, IrqId(40), None, true).unwrap();
    hv.inject_pending(CPU1);
    assert_eq!(hv.irq_state(CPU1, IrqId(40)), Some(IrqState::Injected));
    assert_eq!(hv.platform().injected(CPU1).len(), 1);

    hv.irq_acknowledged(CPU1, IrqId(40));
    assert_eq!(hv.irq_state(CPU1, IrqId(40)), Some(IrqState::Active));

    hv.irq_completed(CPU1, IrqId(40));
    assert_eq!(hv.irq_state(CPU1, IrqId(40)), Some(IrqState::Idle));
    assert_eq!(
        hv.percpu(CPU1).unwrap().stats.get(Stat::Injected as usize),
        Some(1)
    );
}

#[test]
fn active_entries_are_injected_before_new_ones() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    hv.platform().set_slots(1);

    hv.set_pending(CPU1, IrqId(40), None, true).unwrap();
    hv.inject_pending(CPU1);
    hv.irq_acknowledged(CPU1, IrqId(40));
    hv.platform().take_injected(CPU1);

    // 41 が先に積まれても、処理中の 40 が先にスロットへ入る
    hv.set_pending(CPU1, IrqId(41), None, true).unwrap();
    hv.set_pending(CPU1, IrqId(40), None, true).unwrap();
    assert_eq!(hv.irq_state(CPU1, IrqId(40)), Some(IrqState::ActivePending));

    hv.inject_pending(CPU1);
    let injected = hv.platform().injected(CPU1);
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].irq, IrqId(40));

    // 溢れた 41 はキューへ戻り、スロットが空いたら通知が来るよう要求されている
    assert_eq!(hv.irq_state(CPU1, IrqId(41)), Some(IrqState::Pending));
    assert_eq!(hv.percpu(CPU1).unwrap().pending.len(), 1);
    assert!(hv.platform().notify_enabled(CPU1));

    hv.platform().take_injected(CPU1);
    hv.inject_pending(CPU1);
    assert_eq!(hv.platform().injected(CPU1)[0].irq, IrqId(41));
    assert!(!hv.platform().notify_enabled(CPU1));
}

#[test]
fn entries_from_an_old_generation_are_dropped() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let percpu = hv.percpu(CPU1).unwrap();
    let stale = PendingIrq {
        irq: IrqId(60),
        sender: None,
        hw: false,
        generation: next_generation(percpu.generation()),
    };
    percpu.pending.push(stale).unwrap();
    hv.set_pending(CPU1, IrqId(61), None, false).unwrap();

    hv.inject_pending(CPU1);
    let injected = hv.platform().injected(CPU1);
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].irq, IrqId(61));
    assert!(percpu.pending.is_empty());
}

#[test]
fn full_queue_falls_back_to_physical_delivery() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    for n in 0..MAX_PENDING_IRQS as u32 {
        hv.deliver_irq(CPU1, IrqId(32 + n), None, true);
    }
    assert!(hv.platform().physical_pending().is_empty());

    hv.deliver_irq(CPU1, IrqId(100), None, true);
    assert_eq!(hv.platform().physical_pending(), vec![IrqId(100)]);
    assert_eq!(
        hv.percpu(CPU1).unwrap().stats.get(Stat::QueueFull as usize),
        Some(1)
    );
}

#[test]
fn out_of_range_irq_is_rejected() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    assert_eq!(
        hv.set_pending(CPU1, IrqId(300), None, false),
        Err(IrqError::InvalidIrq)
    );
    assert_eq!(hv.irq_state(CPU1, IrqId(300)), None);
}

#[test]
fn cell_signal_resolves_targets_inside_the_sender_cell() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());

    assert_eq!(hv.cell_signal(CPU0, IrqId(1), SignalTarget::AllOthers), Ok(3));
    assert_eq!(hv.irq_state(CPU0, IrqId(1)), Some(IrqState::Idle));
    for cpu in 1..4 {
        assert_eq!(hv.irq_state(CpuId(cpu), IrqId(1)), Some(IrqState::Pending));
    }

    // セル外の CPU 10 は黙って外される
    let mut set = CpuSet::single(CpuId(2));
    set.insert(CpuId(10));
    assert_eq!(hv.cell_signal(CPU0, IrqId(2), SignalTarget::Cpus(set)), Ok(1));
    assert_eq!(hv.irq_state(CpuId(10), IrqId(2)), Some(IrqState::Idle));

    assert_eq!(hv.cell_signal(CPU0, IrqId(3), SignalTarget::ToSelf), Ok(1));
    let entry = hv.percpu(CPU0).unwrap().pending.pop().unwrap();
    assert_eq!(entry.sender, Some(CPU0));
    assert!(!entry.hw);
}

#[test]
fn root_cell_spis_are_routed_to_its_first_cpu() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    assert_eq!(hv.platform().route_of(IrqId(50)), Some(CPU0));
    assert!(hv.cell_owns_irq(CellId::ROOT, IrqId(50)));
}

#[test]
fn physical_irq_for_the_own_cell_is_queued_locally() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    hv.handle_physical_irq(CPU1, IrqId(50));
    assert_eq!(hv.irq_state(CPU1, IrqId(50)), Some(IrqState::Pending));

    // メンテナンス割り込みは注入しない
    hv.handle_physical_irq(CPU1, IrqId(25));
    assert_eq!(hv.irq_state(CPU1, IrqId(25)), Some(IrqState::Idle));
}
