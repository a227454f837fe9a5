// src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル出力。
// - init(): 115200bps, 8N1 に初期化し、以降の出力を有効にする
// - write_str(): 文字列を送信（init 前は何もしない）
// - write_line(): 文字列＋改行を送信
//
// ホスト上のテストでは init() を呼ばないので、ポート I/O は一切発生しない。

use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(target_arch = "x86_64")]
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static SERIAL_ENABLED: AtomicBool = AtomicBool::new(false);

#[cfg(target_arch = "x86_64")]
pub fn init() {
    if SERIAL_ENABLED.load(Ordering::Acquire) {
        return;
    }
    unsafe {
        let mut int_en = Port::<u8>::new(COM1 + 1);
        let mut line_ctrl = Port::<u8>::new(COM1 + 3);
        let mut div_low = Port::<u8>::new(COM1);
        let mut div_high = Port::<u8>::new(COM1 + 1);
        let mut fifo_ctrl = Port::<u8>::new(COM1 + 2);
        let mut modem_ctrl = Port::<u8>::new(COM1 + 4);

        int_en.write(0x00);

        line_ctrl.write(0x80);
        div_low.write(0x01);
        div_high.write(0x00);

        line_ctrl.write(0x03);
        fifo_ctrl.write(0xC7);
        modem_ctrl.write(0x0B);
    }
    SERIAL_ENABLED.store(true, Ordering::Release);
}

#[cfg(not(target_arch = "x86_64"))]
pub fn init() {}

pub fn is_enabled() -> bool {
    SERIAL_ENABLED.load(Ordering::Relaxed)
}

#[cfg(target_arch = "x86_64")]
fn write_byte(byte: u8) {
    unsafe {
        let mut line_status = Port::<u8>::new(COM1 + 5);
        let mut data = Port::<u8>::new(COM1);

        // 送信待ちは有限回で諦める（UART が無い機体で固まらない）
        for _ in 0..100_000 {
            if (line_status.read() & 0x20) != 0 {
                break;
            }
        }
        data.write(byte);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn write_byte(byte: u8) {
    let _ = byte;
}

pub fn write_str(s: &str) {
    if !is_enabled() {
        return;
    }
    for b in s.bytes() {
        write_byte(b);
    }
}

pub fn write_line(s: &str) {
    write_str(s);
    write_str("\r\n");
}

pub fn write_prefixed_line(prefix: &str, msg: &str) {
    write_str(prefix);
    write_line(msg);
}

/// 1 文字だけ出す（デバッグコンソールのハイパーコール用）
pub fn putc(c: u8) {
    if is_enabled() {
        write_byte(c);
    }
}
