// src/logging/mod.rs
//
// ハイパーバイザのログ出力。
// - 出力先は 2 つ: メモリ上のコンソールリング（常時）と COM1（init 後のみ）。
// - 書式は "[LEVEL] msg" の 1 行。数値は info_u64 / info_hex で label = value の形にする。
// - ヒープもフォーマッタも使わない（割り込み/トラップ文脈からも呼べるように）。
//
// 使い分け:
// - info:  正常系の節目（セル生成・起動・破棄など）
// - warn:  回復できた異常（ポリシー違反でセルを止めた、応答タイムアウト 等）
// - error: 不変条件違反・到達してはいけない経路。"INVARIANT VIOLATION:" を先頭に付ける

pub mod console;
mod serial;

pub fn init() {
    serial::init();
}

fn write_prefixed_line(prefix: &str, msg: &str) {
    console::write_line_parts(&[prefix, msg]);
    serial::write_prefixed_line(prefix, msg);
}

pub fn info(msg: &str) {
    write_prefixed_line("[INFO] ", msg);
}

pub fn warn(msg: &str) {
    write_prefixed_line("[WARN] ", msg);
}

pub fn error(msg: &str) {
    write_prefixed_line("[ERROR] ", msg);
}

pub fn info_u64(label: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);
    write_kv("[INFO] ", label, s);
}

pub fn info_hex(label: &str, value: u64) {
    let mut buf = [0u8; 18];
    let s = u64_to_hex(value, &mut buf);
    write_kv("[INFO] ", label, s);
}

pub fn warn_hex(label: &str, value: u64) {
    let mut buf = [0u8; 18];
    let s = u64_to_hex(value, &mut buf);
    write_kv("[WARN] ", label, s);
}

fn write_kv(prefix: &str, key: &str, value: &str) {
    if key.is_empty() {
        console::write_line_parts(&[prefix, value]);
        serial::write_prefixed_line(prefix, value);
        return;
    }
    console::write_line_parts(&[prefix, key, " = ", value]);
    serial::write_str(prefix);
    serial::write_str(key);
    serial::write_str(" = ");
    serial::write_line(value);
}

/// セルからのデバッグ出力（1 文字）
pub fn putc(c: u8) {
    console::write_bytes(&[c]);
    serial::putc(c);
}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 21]) -> &str {
    if value == 0 {
        let last = buf.len() - 1;
        buf[last] = b'0';
        return ascii(&buf[last..]);
    }

    let mut i = buf.len();
    while value > 0 {
        let digit = (value % 10) as u8;
        i -= 1;
        buf[i] = b'0' + digit;
        value /= 10;
    }

    ascii(&buf[i..])
}

fn u64_to_hex(value: u64, buf: &mut [u8; 18]) -> &str {
    buf[0] = b'0';
    buf[1] = b'x';
    for i in 0..16 {
        let n = ((value >> ((15 - i) * 4)) & 0xF) as u8;
        buf[2 + i] = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
    }
    ascii(&buf[..])
}

// 上の 2 関数は ASCII しか書かない
fn ascii(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes).unwrap_or("?")
}

#[cfg(test)]
mod logging_test;
