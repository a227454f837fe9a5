//! Tests for log formatting and the console ring.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn decimal_formatting() {
    let mut buf = [0u8; 21];
    assert_eq!(u64_to_decimal(0, &mut buf), "0");
    let mut buf = [0u8; 21];
    assert_eq!(u64_to_decimal(1234567890, &mut buf), "1234567890");
    let mut buf = [0u8; 21];
    assert_eq!(u64_to_decimal(u64::MAX, &mut buf), "18446744073709551615");
}

#[test]
fn hex_formatting_is_fixed_width() {
    let mut buf = [0u8; 18];
    assert_eq!(u64_to_hex(0xdead_beef, &mut buf), "0x00000000deadbeef");
}

#[test]
fn console_ring_keeps_the_newest_bytes() {
    // 他テストも同じリングへ書くので、自分のマーカーが末尾に現れることだけを見る
    let marker = "ring-marker-42";
    info_u64(marker, 42);

    let mut out = [0u8; console::CONSOLE_SIZE];
    let n = console::snapshot(&mut out);
    let text = core::str::from_utf8(&out[..n]).unwrap_or("");
    assert!(text.contains("[INFO] ring-marker-42 = 42"));
}
