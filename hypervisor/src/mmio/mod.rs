// src/mmio/mod.rs
//
// 役割:
// - second-stage で捕まったメモリアクセスを、登録済みのエミュレーション窓へ振り分ける。
//
// やること:
// - セルごとのトラップ表（固定容量）。登録・解除・検索。
// - 検索は「アクセスを含む窓のうち最も小さいもの」を選ぶ（入れ子の窓は内側が勝つ）。
// - アクセス幅の検査（1/2/4/8 のみ）。書き込み値は幅に合わせて拡張してからハンドラへ渡し、
//   読み出し値は幅で切ってから宛先レジスタの規則（Zero / Sign / Preserve）で戻す。
//
// やらないこと:
// - 命令デコード（arch 側が Access を組み立てる）。
// - どこにも当たらないアクセスの扱いの決定（呼び出し側がポリシー違反として処理する）。
//
// サブモジュール:
// - pci:       PCI コンフィグ空間（所有デバイスはパススルー、それ以外は全 1 読み）
// - hypercall: 管理インタフェースのハイパーコール番号と振り分け

pub mod hypercall;
pub mod pci;

use crate::arch::{Access, Extension, Platform};
use crate::control::percpu::Stat;
use crate::control::trace;
use crate::control::Hypervisor;
use crate::error::{HvError, TrapError};
use crate::mem::addr::PhysAddr;
use crate::mem::region::MemFlags;
use crate::types::{CellId, CpuId, MAX_TRAP_REGIONS};

/// ハンドラへ渡す正規化済みアクセス
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioAccess {
    /// 窓の先頭からのオフセット
    pub offset: u64,
    pub address: u64,
    pub size: u8,
    pub is_write: bool,
    /// 書き込み値（幅に合わせて拡張済み）。読み出しでは 0
    pub value: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmioResult {
    /// 処理した。読み出しなら値を持つ
    Handled(Option<u64>),
    /// どの窓にも当たらない / ハンドラが引き受けなかった
    Unhandled,
    /// 窓には当たったがアクセスとして不正（幅・権限）
    Error,
}

/// 外部から登録できるハンドラ
pub type CustomHandler = fn(&MmioAccess, u64) -> MmioResult;

// fn ポインタを持つので比較はしない
#[derive(Clone, Copy, Debug)]
pub enum TrapHandler {
    /// 割り込みコントローラ distributor（phys_base は実物の物理アドレス）
    IrqChip { phys_base: u64 },
    /// PCI コンフィグ空間全体（個別登録の無いデバイス = 所有していない）
    PciWindow,
    /// 所有している PCI デバイス 1 台分のコンフィグ空間
    PciDevice { phys_base: u64, bdf: u16 },
    /// ページ未満の MMIO をそのまま中継する
    Subpage { phys_base: u64, flags: MemFlags },
    Custom { handler: CustomHandler, arg: u64 },
}

#[derive(Clone, Copy, Debug)]
pub struct TrapRegion {
    pub start: u64,
    pub size: u64,
    pub handler: TrapHandler,
}

impl TrapRegion {
    fn contains(&self, address: u64, size: u8) -> bool {
        address >= self.start
            && address
                .checked_add(size as u64)
                .is_some_and(|end| end <= self.start + self.size)
    }
}

/// セル 1 つ分のトラップ表
pub struct TrapTable {
    regions: [Option<TrapRegion>; MAX_TRAP_REGIONS],
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapTable {
    pub const fn new() -> Self {
        TrapTable {
            regions: [None; MAX_TRAP_REGIONS],
        }
    }

    pub fn register(&mut self, region: TrapRegion) -> Result<(), TrapError> {
        if region.size == 0 || region.start.checked_add(region.size).is_none() {
            return Err(TrapError::EmptyRange);
        }
        if self
            .regions
            .iter()
            .flatten()
            .any(|r| r.start == region.start && r.size == region.size)
        {
            return Err(TrapError::Duplicate);
        }
        let slot = self
            .regions
            .iter_mut()
            .find(|r| r.is_none())
            .ok_or(TrapError::TableFull)?;
        *slot = Some(region);
        Ok(())
    }

    pub fn unregister(&mut self, start: u64, size: u64) -> Result<(), TrapError> {
        let slot = self
            .regions
            .iter_mut()
            .find(|r| matches!(r, Some(r) if r.start == start && r.size == size))
            .ok_or(TrapError::NotRegistered)?;
        *slot = None;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.regions = [None; MAX_TRAP_REGIONS];
    }

    pub fn len(&self) -> usize {
        self.regions.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// アクセス全体を含む窓のうち最小のもの
    pub fn lookup(&self, address: u64, size: u8) -> Option<TrapRegion> {
        self.regions
            .iter()
            .flatten()
            .filter(|r| r.contains(address, size))
            .min_by_key(|r| r.size)
            .copied()
    }
}

pub const fn width_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size as u32)) - 1
    }
}

fn sign_extend(value: u64, size: u8) -> u64 {
    if size >= 8 {
        return value;
    }
    let shift = 64 - 8 * size as u32;
    (((value << shift) as i64) >> shift) as u64
}

/// 書き込み値をハンドラへ渡す形に揃える
pub fn extend_write(access: &Access) -> u64 {
    let narrow = access.value & width_mask(access.size);
    match access.extension {
        Extension::Sign => sign_extend(narrow, access.size),
        Extension::Zero | Extension::Preserve => narrow,
    }
}

/// ハンドラの読み出し値を宛先レジスタへ戻す形に揃える
pub fn narrow_read(value: u64, access: &Access) -> u64 {
    let mask = width_mask(access.size);
    let narrow = value & mask;
    match access.extension {
        Extension::Zero => narrow,
        Extension::Sign => sign_extend(narrow, access.size),
        Extension::Preserve => (access.dest_old & !mask) | narrow,
    }
}

/// ページ未満の窓を物理デバイスへ中継する
fn subpage_access<P: Platform>(platform: &P, access: &MmioAccess, phys_base: u64, flags: MemFlags) -> MmioResult {
    if flags.allowed_io_widths() & access.size == 0 {
        return MmioResult::Error;
    }
    let phys = PhysAddr(phys_base + access.offset);
    if access.is_write {
        if !flags.contains(MemFlags::WRITE) {
            return MmioResult::Error;
        }
        platform.mmio_write(phys, access.size, access.value);
        MmioResult::Handled(None)
    } else {
        if !flags.contains(MemFlags::READ) {
            return MmioResult::Error;
        }
        MmioResult::Handled(Some(platform.mmio_read(phys, access.size)))
    }
}

impl<P: Platform> Hypervisor<P> {
    /// トラップ表へ窓を追加する（セル構成時以外に、外部エミュレータの登録にも使う）
    pub fn register_trap(&self, cell: CellId, region: TrapRegion) -> Result<(), HvError> {
        let mut slot = self.cells.get(cell.index()).ok_or(HvError::NotFound)?.write();
        let c = slot.as_mut().ok_or(HvError::NotFound)?;
        c.traps.register(region)?;
        Ok(())
    }

    /// cpu 上で捕まったアクセスを処理する
    pub fn handle_mmio(&self, cpu: CpuId, access: &Access) -> MmioResult {
        if !matches!(access.size, 1 | 2 | 4 | 8) {
            return MmioResult::Error;
        }
        let Some(percpu) = self.percpu(cpu) else {
            return MmioResult::Error;
        };
        percpu.stats.add(Stat::Mmio);
        trace::trace_mmio(cpu, access.address, access.size, access.is_write);

        let cell = percpu.cell();
        let region = {
            let slot = self.cells[cell.index()].read();
            match slot.as_ref() {
                Some(c) => c.traps.lookup(access.address, access.size),
                None => None,
            }
        };
        let Some(region) = region else {
            return MmioResult::Unhandled;
        };

        let request = MmioAccess {
            offset: access.address - region.start,
            address: access.address,
            size: access.size,
            is_write: access.is_write,
            value: if access.is_write { extend_write(access) } else { 0 },
        };
        let result = match region.handler {
            TrapHandler::IrqChip { phys_base } => self.irqchip_access(cpu, &request, phys_base),
            TrapHandler::PciWindow => pci::unowned_access(&request),
            TrapHandler::PciDevice { phys_base, .. } => {
                pci::device_access(&self.platform, &request, phys_base)
            }
            TrapHandler::Subpage { phys_base, flags } => {
                subpage_access(&self.platform, &request, phys_base, flags)
            }
            TrapHandler::Custom { handler, arg } => handler(&request, arg),
        };

        match result {
            MmioResult::Handled(Some(value)) if !access.is_write => {
                MmioResult::Handled(Some(narrow_read(value, access)))
            }
            MmioResult::Handled(_) if access.is_write => MmioResult::Handled(None),
            MmioResult::Handled(None) => MmioResult::Handled(Some(narrow_read(0, access))),
            other => other,
        }
    }
}
