// src/mem/addr.rs
//
// 役割:
// - ホスト物理アドレス / ゲスト物理アドレスを型で区別する。
// - second-stage 変換の入力（GuestAddr）と出力（PhysAddr）を取り違えないための newtype。
// やること:
// - ページ境界の判定・切り下げ・切り上げ。
// - ハードウェアのアドレス幅に収まるかの判定（x86_64::PhysAddr の検査を流用）。
// やらないこと:
// - ページテーブルそのものの操作（mm/paging.rs 側で行う）。

use core::fmt;

/// ページサイズ（4KiB）
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// 2MiB / 1GiB の大きいページ
pub const HUGE_PAGE_2M: u64 = 1 << 21;
pub const HUGE_PAGE_1G: u64 = 1 << 30;

/// ホスト物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u64);

/// ゲスト物理アドレス（セルから見たアドレス、バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddr(pub u64);

pub const fn is_page_aligned(value: u64) -> bool {
    value & !PAGE_MASK == 0
}

pub const fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & PAGE_MASK
}

impl PhysAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    pub const fn offset(self, delta: u64) -> PhysAddr {
        PhysAddr(self.0 + delta)
    }

    /// [self, self+size) がアドレス幅 `bits` に収まるか。
    ///
    /// アーキテクチャ上限（52bit）は x86_64::PhysAddr の検査に任せ、
    /// プラットフォーム固有の幅はここで追加で見る。
    pub fn fits_width(self, size: u64, bits: u8) -> bool {
        let last = match size.checked_sub(1).and_then(|s| self.0.checked_add(s)) {
            Some(last) => last,
            None => return size == 0,
        };
        if x86_64::PhysAddr::try_new(last).is_err() {
            return false;
        }
        bits >= 64 || last >> bits == 0
    }
}

impl GuestAddr {
    pub const fn align_down(self) -> GuestAddr {
        GuestAddr(self.0 & PAGE_MASK)
    }

    pub const fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    pub const fn offset(self, delta: u64) -> GuestAddr {
        GuestAddr(self.0 + delta)
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestAddr({:#x})", self.0)
    }
}
