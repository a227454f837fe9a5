// src/arch/cpu.rs
// CPU 命令ラッパ（x86_64）。unsafe は最小限。

use x86_64::instructions::interrupts;

/// 割り込みを止めて hlt し続ける（戻らない）
pub fn halt_loop() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
