//! Tests for the per-CPU state machine and the bounded suspend handshake.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use super::*;
use crate::arch::TrapEvent;
use crate::control::lifecycle::CPU_FAILED;
use crate::error::HvError;
use crate::types::IrqId;
use crate::test_support::{boot_hypervisor, root_cell, test_tunables, CpuRunner, TestHv};
use crate::HvConfig;

const CPU1: CpuId = CpuId(1);
const CPU2: CpuId = CpuId(2);
const CPU3: CpuId = CpuId(3);

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::yield_now();
    }
}

fn short_wait() -> HvConfig {
    HvConfig {
        suspend_retries: 20_000,
        ..test_tunables()
    }
}

/// runner で Suspended まで持っていき、runner を止めてから返す
fn suspend_and_stop(hv: &'static TestHv, cpu: CpuId) {
    let runner = CpuRunner::spawn(hv, cpu);
    hv.suspend_cpu(cpu).unwrap();
    drop(runner);
    assert_eq!(hv.cpu_state(cpu), Some(CpuState::Suspended));
}

#[test]
fn boot_is_accepted_once_and_only_for_root_cpus() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Active));
    assert_eq!(
        hv.on_cpu_boot(CPU1),
        Err(HvError::Control(ControlError::InvalidState))
    );
    assert_eq!(hv.on_cpu_boot(CpuId(9)), Err(HvError::InvalidArgument));
    assert_eq!(hv.cpu_state(CpuId(9)), Some(CpuState::Offline));
    assert_eq!(hv.cpu_state(CpuId(64)), None);
}

#[test]
fn suspend_then_resume_returns_to_active() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let _runner = CpuRunner::spawn(hv, CPU1);

    hv.suspend_cpu(CPU1).unwrap();
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Suspended));
    assert!(hv.platform().events_to(CPU1) >= 1);

    hv.resume_cpu(CPU1);
    wait_for(|| hv.cpu_state(CPU1) == Some(CpuState::Active));
}

#[test]
fn resume_of_a_running_cpu_changes_nothing() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let generation = hv.percpu(CPU1).unwrap().generation();

    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Resume(None));
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Active));
    assert_eq!(hv.percpu(CPU1).unwrap().generation(), generation);
}

#[test]
fn reset_enters_at_the_requested_address() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    suspend_and_stop(hv, CPU1);
    let generation = hv.percpu(CPU1).unwrap().generation();

    hv.reset_cpu(CPU1, 0x1000, 0x2A).unwrap();
    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Enter);

    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Active));
    assert_eq!(hv.platform().enters(), vec![(CPU1, 0x1000, 0x2A)]);
    assert_ne!(hv.percpu(CPU1).unwrap().generation(), generation);
}

#[test]
fn reset_and_park_need_a_suspended_cpu() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    assert_eq!(
        hv.reset_cpu(CPU1, 0x1000, 0),
        Err(HvError::Control(ControlError::InvalidState))
    );
    assert_eq!(
        hv.park_cpu(CPU1),
        Err(HvError::Control(ControlError::InvalidState))
    );
    assert!(hv.platform().enters().is_empty());
}

#[test]
fn parked_cpu_stays_parked_across_suspend() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    suspend_and_stop(hv, CPU1);
    hv.park_cpu(CPU1).unwrap();
    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Park);
    assert_eq!(hv.platform().parked(), vec![CPU1]);

    let runner = CpuRunner::spawn(hv, CPU1);
    hv.suspend_cpu(CPU1).unwrap();
    hv.resume_cpu(CPU1);
    wait_for(|| hv.cpu_state(CPU1) == Some(CpuState::Parked));
    drop(runner);
    // park の後処理は 1 回だけ
    assert_eq!(hv.platform().parked(), vec![CPU1]);
}

#[test]
fn violation_during_a_pending_suspend_lets_the_suspend_finish_first() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let waiter = std::thread::spawn(move || hv.suspend_cpu(CPU1));
    wait_for(|| hv.cpu_state(CPU1) == Some(CpuState::SuspendRequested));

    // 違反しても suspend の握手は先に終わる
    assert_eq!(hv.on_trap(CPU1, &TrapEvent::Unknown(7)), CpuAction::Wait);
    assert_eq!(waiter.join().unwrap(), Ok(()));
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Suspended));
    assert!(hv.platform().parked().is_empty());

    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Park);
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::Parked));
    assert_eq!(hv.platform().parked(), vec![CPU1]);
    assert_eq!(hv.cpu_get_info(CpuId(0), CPU1, 0), Ok(CPU_FAILED));
}

#[test]
fn irq_queued_while_suspended_is_injected_on_resume() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    suspend_and_stop(hv, CPU1);
    let generation = hv.percpu(CPU1).unwrap().generation();

    hv.set_pending(CPU1, IrqId(40), None, false).unwrap();
    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Resume(None));

    // 同じ世代のまま戻ったので捨てられない
    assert_eq!(hv.percpu(CPU1).unwrap().generation(), generation);
    let injected = hv.platform().injected(CPU1);
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].irq, IrqId(40));
}

#[test]
fn irq_queued_before_a_reset_is_dropped() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    suspend_and_stop(hv, CPU1);

    hv.set_pending(CPU1, IrqId(40), None, false).unwrap();
    hv.reset_cpu(CPU1, 0x1000, 0).unwrap();
    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Enter);
    assert!(hv.platform().injected(CPU1).is_empty());
}

#[test]
fn silent_cpu_is_marked_failed_after_bounded_wait() {
    let hv = boot_hypervisor(&root_cell(), short_wait());

    assert_eq!(
        hv.suspend_cpu(CPU2),
        Err(HvError::Control(ControlError::Unresponsive))
    );
    assert_eq!(hv.cpu_state(CPU2), Some(CpuState::Failed));
    assert!(hv.platform().relax_calls() >= 20_000);
    assert!(hv.percpu(CPU2).unwrap().is_failed());

    // Failed は以後の suspend から外れる
    let _runner = CpuRunner::spawn(hv, CPU1);
    let both = CpuSet::from_bits(0b110);
    assert_eq!(hv.suspend_cpus(both, None), Ok(CpuSet::single(CPU1)));
    assert_eq!(hv.on_wake(CPU2), CpuAction::Park);
}

#[test]
fn group_suspend_is_all_or_nothing() {
    let hv = boot_hypervisor(&root_cell(), short_wait());
    let _runner = CpuRunner::spawn(hv, CPU1);

    let group = CpuSet::from_bits(0b1010);
    assert_eq!(
        hv.suspend_cpus(group, None),
        Err(HvError::Control(ControlError::Unresponsive))
    );
    assert_eq!(hv.cpu_state(CPU3), Some(CpuState::Failed));
    wait_for(|| hv.cpu_state(CPU1) == Some(CpuState::Active));
}

#[test]
fn except_leaves_the_caller_running() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let _runners = CpuRunner::spawn_all(hv, &[1, 2, 3]);

    let all = hv.cell_cpus(CellId::ROOT);
    let suspended = hv.suspend_cpus(all, Some(CpuId(0))).unwrap();
    assert_eq!(suspended, CpuSet::from_bits(0b1110));
    assert_eq!(hv.cpu_state(CpuId(0)), Some(CpuState::Active));

    hv.resume_cpus(suspended);
    for cpu in suspended.iter() {
        wait_for(|| hv.cpu_state(cpu) == Some(CpuState::Active));
    }
}

#[test]
fn offline_cpu_cannot_be_suspended() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    assert_eq!(
        hv.suspend_cpu(CpuId(12)),
        Err(HvError::Control(ControlError::InvalidState))
    );
    assert_eq!(
        hv.suspend_cpu(CpuId(64)),
        Err(HvError::Control(ControlError::InvalidCpu))
    );
}

#[test]
fn shutdown_is_carried_out_by_the_cpu_itself() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    suspend_and_stop(hv, CPU1);
    hv.shutdown_cpu(CPU1).unwrap();
    assert!(hv.platform().shutdown_cpus().is_empty());

    hv.resume_cpu(CPU1);
    assert_eq!(hv.on_wake(CPU1), CpuAction::Shutdown);
    assert_eq!(hv.cpu_state(CPU1), Some(CpuState::ShuttingDown));
    assert_eq!(hv.platform().shutdown_cpus(), vec![CPU1]);
    assert_eq!(
        hv.suspend_cpu(CPU1),
        Err(HvError::Control(ControlError::InvalidState))
    );
}

#[test]
fn flush_recommits_the_cell_tables_on_next_resume() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let before = hv.platform().commits().len();
    let boot_roots = hv.platform().last_commit(CPU1);

    hv.percpu(CPU1).unwrap().request_flush();
    assert_eq!(hv.on_wake(CPU1), CpuAction::Resume(None));
    assert_eq!(hv.platform().commits().len(), before + 1);
    assert_eq!(hv.platform().last_commit(CPU1), boot_roots);

    // 一度 commit したら要求は消える
    hv.on_wake(CPU1);
    assert_eq!(hv.platform().commits().len(), before + 1);
}

#[test]
fn stats_are_addressed_by_index() {
    let hv = boot_hypervisor(&root_cell(), test_tunables());
    let stats = &hv.percpu(CPU1).unwrap().stats;
    stats.add(Stat::Management);
    stats.add(Stat::Management);
    assert_eq!(stats.get(Stat::Management as usize), Some(2));
    assert_eq!(stats.get(Stat::Mmio as usize), Some(0));
    assert_eq!(stats.get(NUM_STATS), None);
}
