// src/logging/console.rs
//
// ハイパーバイザコンソール（メモリ上のリングバッファ）。
// - write_line_parts() / write_bytes(): 末尾に追記（古いものから上書き）
// - snapshot(): 現在の内容を古い順に取り出す（ルートセルの仮想コンソール / テスト用）
//
// 目的:
// - シリアルが無い環境でも「何が起きたか」を後から読めるようにする。
// - 別 CPU から読まれる前提なので各バイトは Volatile で書く。

use spin::{Lazy, Mutex};
use volatile::Volatile;

pub const CONSOLE_SIZE: usize = 4096;

#[repr(transparent)]
struct Buffer {
    chars: [Volatile<u8>; CONSOLE_SIZE],
}

struct Ring {
    buffer: Buffer,
    /// これまでに書いた総バイト数（tail = written % CONSOLE_SIZE）
    written: u64,
}

impl Ring {
    fn write_byte(&mut self, byte: u8) {
        let pos = (self.written % CONSOLE_SIZE as u64) as usize;
        self.buffer.chars[pos].write(byte);
        self.written += 1;
    }
}

static RING: Lazy<Mutex<Ring>> = Lazy::new(|| {
    Mutex::new(Ring {
        buffer: Buffer {
            chars: core::array::from_fn(|_| Volatile::new(0u8)),
        },
        written: 0,
    })
});

pub fn write_bytes(bytes: &[u8]) {
    let mut ring = RING.lock();
    for b in bytes {
        ring.write_byte(*b);
    }
}

/// 複数の断片を 1 行として書く（他 CPU の出力と行の途中で混ざらない）
pub fn write_line_parts(parts: &[&str]) {
    let mut ring = RING.lock();
    for part in parts {
        for b in part.bytes() {
            ring.write_byte(b);
        }
    }
    ring.write_byte(b'\n');
}

/// 古い順に最大 out.len() バイトをコピーし、コピーしたバイト数を返す。
pub fn snapshot(out: &mut [u8]) -> usize {
    let ring = RING.lock();
    let stored = ring.written.min(CONSOLE_SIZE as u64) as usize;
    let start = ring.written - stored as u64;
    let count = stored.min(out.len());
    let skip = stored - count;
    for (n, slot) in out.iter_mut().take(count).enumerate() {
        let pos = ((start + (skip + n) as u64) % CONSOLE_SIZE as u64) as usize;
        *slot = ring.buffer.chars[pos].read();
    }
    count
}

/// 総書き込みバイト数（読み手が差分を取るためのカーソル）
pub fn written() -> u64 {
    RING.lock().written
}
