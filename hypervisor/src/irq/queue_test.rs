//! Tests for the per-CPU pending interrupt ring.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use super::*;

fn entry(irq: u32, generation: u32) -> PendingIrq {
    PendingIrq {
        irq: IrqId(irq),
        sender: None,
        hw: false,
        generation,
    }
}

#[test]
fn packing_preserves_every_field() {
    let e = PendingIrq {
        irq: IrqId(1023),
        sender: Some(CpuId(63)),
        hw: true,
        generation: 0x7FFF_FFFF,
    };
    assert_eq!(decode(encode(&e)), e);
    assert_eq!(decode(encode(&entry(5, 0))), entry(5, 0));
}

#[test]
fn fifo_order_and_full_detection() {
    let q = PendingQueue::new();
    for n in 0..q.capacity() as u32 {
        q.push(entry(n, 1)).unwrap();
    }
    assert_eq!(q.push(entry(99, 1)), Err(IrqError::QueueFull));
    assert_eq!(q.len(), q.capacity());

    assert_eq!(q.pop().unwrap().irq, IrqId(0));
    // 1 件空いたので積める
    q.push(entry(99, 1)).unwrap();
    for n in 1..q.capacity() as u32 {
        assert_eq!(q.pop().unwrap().irq, IrqId(n));
    }
    assert_eq!(q.pop().unwrap().irq, IrqId(99));
    assert!(q.pop().is_none());
}

#[test]
fn clear_drops_everything() {
    let q = PendingQueue::new();
    q.push(entry(1, 0)).unwrap();
    q.push(entry(2, 0)).unwrap();
    q.clear();
    assert!(q.is_empty());
    assert!(q.pop().is_none());
}

#[test]
fn generation_wraps_within_31_bits() {
    assert_eq!(next_generation(0x7FFF_FFFF), 0);
    assert_eq!(next_generation(7), 8);
}

#[test]
fn concurrent_producers_lose_nothing_and_duplicate_nothing() {
    let q = Arc::new(PendingQueue::new());
    let producers = 4u32;
    let per_producer = 200u32;

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut full = 0u32;
                for n in 0..per_producer {
                    let e = PendingIrq {
                        irq: IrqId(n),
                        sender: Some(CpuId(p)),
                        hw: false,
                        generation: 0,
                    };
                    while q.push(e).is_err() {
                        full += 1;
                        thread::yield_now();
                    }
                }
                full
            })
        })
        .collect();

    // 消費者はこのスレッドだけ
    let mut seen = vec![vec![false; per_producer as usize]; producers as usize];
    let mut received = 0;
    while received < producers * per_producer {
        if let Some(e) = q.pop() {
            let sender = e.sender.unwrap().0 as usize;
            assert!(!seen[sender][e.irq.index()], "duplicate delivery");
            seen[sender][e.irq.index()] = true;
            received += 1;
        } else {
            thread::yield_now();
        }
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(q.is_empty());
    assert!(seen.iter().all(|per| per.iter().all(|s| *s)));
}

proptest! {
    // push / pop を任意に混ぜても、容量を超えず FIFO のまま
    #[test]
    fn interleaved_use_matches_a_bounded_fifo(ops in proptest::collection::vec(any::<Option<u16>>(), 0..200)) {
        let queue = PendingQueue::new();
        let mut model = VecDeque::new();
        for op in ops {
            match op {
                Some(irq) => {
                    let pushed = queue.push(entry(irq as u32, 1));
                    if model.len() < MAX_PENDING_IRQS {
                        prop_assert!(pushed.is_ok());
                        model.push_back(irq as u32);
                    } else {
                        prop_assert_eq!(pushed, Err(IrqError::QueueFull));
                    }
                }
                None => {
                    prop_assert_eq!(queue.pop().map(|e| e.irq.0), model.pop_front());
                }
            }
            prop_assert_eq!(queue.len(), model.len());
        }
    }
}
