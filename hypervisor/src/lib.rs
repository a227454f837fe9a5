/*!
 * hypervisor
 *
 * 役割:
 *   - マルチコア機を「セル」に分割する静的パーティショニング・ハイパーバイザのコア。
 *   - セルのライフサイクル、CPU ごとの制御状態機械、second-stage メモリ分割、
 *     割り込み仮想化エンジン、トラップされたアクセスの振り分け。
 *
 * 構成（葉から順に）:
 *   - mm:      ページプールと second-stage テーブル（セルごとの AddressSpace）
 *   - irq:     保留割り込みキュー・注入・ルーティング、distributor のエミュレーション
 *   - mmio:    トラップ表と MMIO / PCI コンフィグ空間 / ハイパーコールの振り分け
 *   - control: CPU 制御ブロック、セル、通信ページ、ライフサイクル、アーキ側の入口
 *
 * やらないこと:
 *   - 特権モードの出入りそのもの（arch::Platform の実装側）。
 *   - ヒープ確保。全テーブルは types.rs の定数で容量が決まる固定配列。
 */

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod control;
pub mod error;
pub mod irq;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod mmio;
pub mod types;

#[cfg(all(not(test), target_os = "none"))]
mod panic;

#[cfg(test)]
mod test_support;

pub use arch::{Access, CpuAction, Extension, Platform, TrapEvent};
pub use config::{CellConfig, SystemConfig};
pub use control::{HvConfig, Hypervisor};
pub use error::HvError;
pub use types::{CellId, CpuId, CpuSet, IrqId};
