// src/mem/mod.rs
//
// 役割:
// - メモリ関連の基本型をまとめる中継点。
// - addr.rs（アドレス newtype）/ region.rs（メモリ領域と属性）を公開する。

pub mod addr;
pub mod region;

pub use addr::{GuestAddr, PhysAddr, PAGE_SIZE};
pub use region::{MemFlags, MemoryRegion};
