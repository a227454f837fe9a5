// src/panic.rs
//
// 実機（target_os = "none"）用 panic ハンドラ。
// - コントロールプレーンは panic しない前提。ここに来たら分離の保証はもう無い。
// - 挙動は「緊急出力（ロック無し） → CPU 停止」に固定する。
// - logging のリングはロックを取るので使わない（panic 中の再入でデッドロックする）。
// - 二重 panic は即停止。

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

use crate::arch::cpu;

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

const COM1_DATA: u16 = 0x3F8;
const COM1_LSR: u16 = 0x3FD;

fn emergency_write_byte(b: u8) {
    // Safety: COM1 のポート I/O のみ。他 CPU と文字が混ざることはあるが壊れはしない。
    unsafe {
        let mut lsr = Port::<u8>::new(COM1_LSR);
        let mut data = Port::<u8>::new(COM1_DATA);
        for _ in 0..10_000 {
            if (lsr.read() & 0x20) != 0 {
                break;
            }
        }
        data.write(b);
    }
}

fn emergency_write_str(s: &str) {
    for b in s.bytes() {
        emergency_write_byte(b);
    }
}

fn emergency_write_dec(mut v: u64) {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    for &b in &buf[i..] {
        emergency_write_byte(b);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();

    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        emergency_write_str("[PANIC] re-entered => halt\n");
        cpu::halt_loop();
    }

    emergency_write_str("[PANIC] hypervisor panic\n");
    if let Some(loc) = info.location() {
        emergency_write_str("[PANIC] ");
        emergency_write_str(loc.file());
        emergency_write_str(":");
        emergency_write_dec(loc.line() as u64);
        emergency_write_str("\n");
    }
    cpu::halt_loop()
}
