// src/irq/queue.rs
//
// CPU ごとの保留割り込みキュー（固定容量リング）。
//
// 並行性の約束:
// - push は任意の CPU から呼べる（生産者同士は producer ロックで直列化）。
// - pop / clear は持ち主の CPU だけが呼ぶ（消費者は 1 つ）。
// - 各スロットは u64 1 語に詰めてあるので、生産者が書いて tail を Release で進めれば、
//   消費者は tail を Acquire で読んだ後にそのスロットを安全に読める。
//
// 満杯の判定は tail - head == 容量。満杯時は QueueFull を返し、捨てる判断は呼び出し側に任せる
// （呼び出し側は物理ペンディングへフォールバックする）。

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::IrqError;
use crate::types::{CpuId, IrqId, MAX_PENDING_IRQS};

const NO_SENDER: u64 = 0xFFFF;

/// 保留中の仮想割り込み 1 件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingIrq {
    pub irq: IrqId,
    /// ソフトウェア生成割り込みの送り手
    pub sender: Option<CpuId>,
    /// 物理割り込みのパススルー（ゲストの EOI を物理側へ伝える必要がある）
    pub hw: bool,
    /// 積んだ時点での宛先 CPU の世代。注入時に一致しなければ捨てる
    pub generation: u32,
}

// | generation:31 | hw:1 | sender:16 | irq:16 |
fn encode(entry: &PendingIrq) -> u64 {
    let sender = entry.sender.map_or(NO_SENDER, |c| c.0 as u64 & 0xFFFF);
    (entry.irq.0 as u64 & 0xFFFF)
        | (sender << 16)
        | ((entry.hw as u64) << 32)
        | ((entry.generation as u64 & 0x7FFF_FFFF) << 33)
}

fn decode(raw: u64) -> PendingIrq {
    let sender = (raw >> 16) & 0xFFFF;
    PendingIrq {
        irq: IrqId((raw & 0xFFFF) as u32),
        sender: (sender != NO_SENDER).then_some(CpuId(sender as u32)),
        hw: (raw >> 32) & 1 != 0,
        generation: (raw >> 33) as u32,
    }
}

/// 世代番号は 31 ビットで回す（encode と同じ幅）
pub const fn next_generation(generation: u32) -> u32 {
    generation.wrapping_add(1) & 0x7FFF_FFFF
}

pub struct PendingQueue {
    producer: Mutex<()>,
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: [AtomicU64; MAX_PENDING_IRQS],
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub const fn new() -> Self {
        PendingQueue {
            producer: Mutex::new(()),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: [const { AtomicU64::new(0) }; MAX_PENDING_IRQS],
        }
    }

    pub const fn capacity(&self) -> usize {
        MAX_PENDING_IRQS
    }

    pub fn push(&self, entry: PendingIrq) -> Result<(), IrqError> {
        let _guard = self.producer.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= MAX_PENDING_IRQS {
            return Err(IrqError::QueueFull);
        }
        self.slots[tail % MAX_PENDING_IRQS].store(encode(&entry), Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// 持ち主の CPU だけが呼ぶ
    pub fn pop(&self) -> Option<PendingIrq> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let raw = self.slots[head % MAX_PENDING_IRQS].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(decode(raw))
    }

    /// 全件捨てる（持ち主の CPU が reset 時に呼ぶ）
    pub fn clear(&self) {
        let _guard = self.producer.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        self.head.store(tail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
