// src/mem/region.rs
//
// 役割:
// - セル設定に書かれた「メモリ領域」1 つ分を表す。
// - アクセス属性（R/W/X/DMA/IO/...）を bitflags で持つ。
//
// やらないこと:
// - ページテーブルへの反映（mm/address_space.rs が行う）。

use crate::mem::addr::{is_page_aligned, GuestAddr, PhysAddr};

bitflags::bitflags! {
    /// メモリ領域のアクセス属性
    ///
    /// 値は設定記述子のバイナリ表現とそのまま一致する。
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        /// デバイスからの DMA を許す（I/O-MMU にも同じ写像を張る）
        const DMA = 0x0008;
        /// MMIO（キャッシュ無効でマップ）
        const IO = 0x0010;
        /// ハイパーバイザが用意する通信ページ（物理 backing を持たない）
        const COMM_REGION = 0x0020;
        /// セル開始前までルートセルから書き込める
        const LOADABLE = 0x0040;
        /// ルートセルからも引き続き見える共有領域
        const ROOTSHARED = 0x0080;
        /// ページ境界に乗らない MMIO（trap で中継する）
        const IO_UNALIGNED = 0x0100;
        const IO_8 = 1 << 16;
        const IO_16 = 2 << 16;
        const IO_32 = 4 << 16;
        const IO_64 = 8 << 16;
    }
}

impl MemFlags {
    pub const IO_WIDTH_MASK: MemFlags = MemFlags::IO_8
        .union(MemFlags::IO_16)
        .union(MemFlags::IO_32)
        .union(MemFlags::IO_64);

    /// sub-page MMIO で許すアクセス幅（バイト数のビット集合: 1,2,4,8）
    ///
    /// 幅指定なしは 4 バイトのみ許可とする。
    pub fn allowed_io_widths(self) -> u8 {
        let w = ((self & MemFlags::IO_WIDTH_MASK).bits() >> 16) as u8;
        if w == 0 {
            4
        } else {
            w
        }
    }
}

/// メモリ領域 1 つ分（設定記述子から取り出した形）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// None = 物理 backing なし（通信ページなど）
    pub phys_start: Option<PhysAddr>,
    pub guest_start: GuestAddr,
    pub size: u64,
    pub flags: MemFlags,
}

impl MemoryRegion {
    pub const fn guest_end(&self) -> u64 {
        self.guest_start.0 + self.size
    }

    pub fn phys_end(&self) -> Option<u64> {
        self.phys_start.map(|p| p.0 + self.size)
    }

    pub fn is_comm_region(&self) -> bool {
        self.flags.contains(MemFlags::COMM_REGION)
    }

    /// ページ境界に乗らない MMIO か（マップではなく trap で扱う）
    pub fn is_subpage(&self) -> bool {
        !is_page_aligned(self.guest_start.0) || !is_page_aligned(self.size)
    }

    pub fn overlaps_guest(&self, other: &MemoryRegion) -> bool {
        ranges_overlap(self.guest_start.0, self.size, other.guest_start.0, other.size)
    }

    pub fn overlaps_phys(&self, other: &MemoryRegion) -> bool {
        match (self.phys_start, other.phys_start) {
            (Some(a), Some(b)) => ranges_overlap(a.0, self.size, b.0, other.size),
            _ => false,
        }
    }

    /// 物理範囲 [phys, phys+size) をこの領域が丸ごと含むか
    pub fn contains_phys(&self, phys: u64, size: u64) -> bool {
        match self.phys_start {
            Some(start) => phys >= start.0 && phys + size <= start.0 + self.size,
            None => false,
        }
    }

    /// other と物理的に重なる部分を、この領域のゲストアドレスで表した領域として返す。
    /// フラグはこの領域のものを使う（ルートセルへの書き戻し用）。
    pub fn phys_overlap(&self, other: &MemoryRegion) -> Option<MemoryRegion> {
        let (self_phys, other_phys) = (self.phys_start?, other.phys_start?);
        let start = self_phys.0.max(other_phys.0);
        let end = (self_phys.0 + self.size).min(other_phys.0 + other.size);
        if start >= end {
            return None;
        }
        Some(MemoryRegion {
            phys_start: Some(PhysAddr(start)),
            guest_start: GuestAddr(self.guest_start.0 + (start - self_phys.0)),
            size: end - start,
            flags: self.flags,
        })
    }
}

pub const fn ranges_overlap(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    a_size != 0 && b_size != 0 && a_start < b_start + b_size && b_start < a_start + a_size
}
