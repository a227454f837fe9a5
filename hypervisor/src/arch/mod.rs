// src/arch/mod.rs
//
// アーキ依存部との境界。
// - コア側（mm / irq / mmio / control）はこの trait だけを通してハードウェアに触る。
// - 実装は 1 つのハイパーバイザにつき 1 つ（実機用 backend / テスト用 mock）。
//
// 契約（実装側が守ること）:
// - commit_second_stage: その CPU の変換ルートを差し替え、古い変換を TLB から落とす。
//   呼ばれるのは必ず「対象 CPU 自身」のコンテキストから。
// - enter_cell: レジスタファイルをリセットし、entry / context を設定する。次のエントリで効く。
// - send_event: 対象 CPU を「ハイパーバイザへ戻す」ための通知。取りこぼしてもよいが、
//   対象が次にトラップした時に handle_events が呼ばれることは保証する。
// - inject_irq: 仮想割り込みを注入スロットへ置く。空きが無ければ Err(SlotsFull)。
//
// cpu: hlt / pause など CPU 命令ラッパ（実機 backend と panic ハンドラ用）

#[cfg(target_arch = "x86_64")]
pub mod cpu;

#[cfg(test)]
pub mod mock;

use crate::irq::queue::PendingIrq;
use crate::mem::addr::PhysAddr;
use crate::types::{CpuId, IrqId};

/// 読み出し値をレジスタへ戻すときの規則
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    /// 上位ビットを 0 にする
    Zero,
    /// 符号拡張する
    Sign,
    /// 宛先レジスタの上位ビットを残す
    Preserve,
}

/// トラップしたメモリアクセス 1 回分（アーキ側が命令をデコードして作る）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    /// ゲスト物理アドレス
    pub address: u64,
    /// バイト幅
    pub size: u8,
    pub is_write: bool,
    /// 書き込み時: ソースレジスタの値（幅で切る前）
    pub value: u64,
    pub extension: Extension,
    /// 読み出し時: 宛先レジスタの元の値（Preserve 用）
    pub dest_old: u64,
}

/// アーキ固有のトラップを、コアが扱えるイベントへ写したもの
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapEvent {
    Mmio(Access),
    Hypercall { code: u64, arg1: u64, arg2: u64 },
    /// 他 CPU からの管理通知
    Management,
    /// 他 CPU が保留キューへ積んだ
    InjectKick,
    /// パススルー割り込みが物理的に届いた
    PhysicalIrq(IrqId),
    /// ゲストが注入済み割り込みを受理した
    IrqAck(IrqId),
    /// ゲストが割り込み処理を完了した
    IrqEoi(IrqId),
    /// 注入スロットに空きができた
    Maintenance,
    /// 解釈できない例外（理由コード）
    Unknown(u64),
}

/// send_event の種類
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Management,
    Inject,
}

/// 注入スロットが全部埋まっている
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotsFull;

/// トラップ処理後にアーキ側がとるべき行動
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuAction {
    /// セルへ戻る。Some(v) は読み出し値 / ハイパーコール戻り値として宛先レジスタへ書く
    Resume(Option<u64>),
    /// suspend 中。cpu_relax して handle_events を呼び直す
    Wait,
    /// park 中。低消費電力で待ち、通知が来たら handle_events を呼び直す
    Park,
    /// enter_cell でレジスタを作り直した。そのままセルへ入る
    Enter,
    /// ハイパーバイザから抜ける
    Shutdown,
}

pub trait Platform: Sync {
    /// アーキ固有のトラップ情報（VM exit 理由 + レジスタ等）
    type Trap;

    fn commit_second_stage(&self, cpu: CpuId, stage2_root: PhysAddr, dma_root: PhysAddr);

    fn enter_cell(&self, cpu: CpuId, entry: u64, context: u64);

    /// 物理割り込みの配送先を変える
    fn route_physical_irq(&self, irq: IrqId, target: CpuId);

    fn translate_trap(&self, cpu: CpuId, trap: &Self::Trap) -> TrapEvent;

    fn send_event(&self, target: CpuId, kind: EventKind);

    /// active は「その割り込みがすでにゲスト内で処理中」であることを示す
    fn inject_irq(&self, cpu: CpuId, irq: &PendingIrq, active: bool) -> Result<(), SlotsFull>;

    /// 注入スロットが空いたら Maintenance を上げるかどうか
    fn set_injection_notify(&self, cpu: CpuId, enabled: bool);

    /// キューに入らなかった割り込みを物理コントローラ側で保留にし直す
    fn set_physical_pending(&self, irq: IrqId);

    fn mmio_read(&self, phys: PhysAddr, size: u8) -> u64;

    fn mmio_write(&self, phys: PhysAddr, size: u8, value: u64);

    /// 物理メモリから読む（ハイパーコール引数の記述子コピー用）。範囲外なら false
    fn read_phys(&self, phys: PhysAddr, buf: &mut [u8]) -> bool;

    /// CPU を低消費電力待ちへ落とす準備（park 入り口で一度だけ呼ばれる）
    fn park_cpu(&self, cpu: CpuId);

    fn shutdown_cpu(&self, cpu: CpuId);

    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }
}
