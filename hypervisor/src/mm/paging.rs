// src/mm/paging.rs
//
// 役割:
// - 4 段（L4/L3/L2/L1）の second-stage ページテーブルを、ページプール上で構築・解体する。
// - エントリ形式は EPT 互換（bit0 R / bit1 W / bit2 X / bit3-5 メモリタイプ / bit7 大ページ）。
//   I/O-MMU の second-level テーブルも同じ形式で張る。
//
// やること:
// - map:   1GiB / 2MiB の大ページを使えるところは使って範囲をマップする。
// - unmap: 範囲を外す。大ページの一部だけ外す場合は 1 段下に分割する。
//          空になった下位テーブルはプールへ返す。
// - translate: ゲスト物理 → ホスト物理の逆引き（権限付き）。
//
// やらないこと:
// - TLB 無効化（arch 側の commit_second_stage が行う）。
// - 論理的な重なり検査（address_space.rs が行う）。

use x86_64::VirtAddr;

use crate::mem::addr::{GuestAddr, PhysAddr, PAGE_SIZE};
use crate::mm::{PageIndex, PagePool};

bitflags::bitflags! {
    /// second-stage エントリのビット
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// メモリタイプ WB（6 << 3）。立っていなければ UC。
        const MEMTYPE_WB = 6 << 3;
        const IGNORE_PAT = 1 << 6;
        /// L3/L2 での大ページ終端
        const HUGE = 1 << 7;
    }
}

impl EntryFlags {
    pub const ACCESS: EntryFlags = EntryFlags::READ
        .union(EntryFlags::WRITE)
        .union(EntryFlags::EXECUTE);

    /// 下位テーブルを指すエントリに付ける属性
    pub const TABLE: EntryFlags = EntryFlags::ACCESS;
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const ENTRIES: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// ページテーブル用プールが枯渇した
    OutOfPageTableCapacity,
    Misaligned,
    OverlapsExistingRegion,
    UnsupportedAccessCombination,
    /// ハードウェアのアドレス幅を超える
    AddressWidthExceeded,
    /// セルの論理領域リストが満杯
    TooManyRegions,
    /// revoke 対象がコミットされていない
    NotCommitted,
    /// テーブルがプール外を指している（内部不整合）
    CorruptTable,
}

/// 1 エントリの解釈結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Invalid,
    Table(PageIndex),
    Leaf { phys: u64, flags: EntryFlags },
}

/// レベル n のエントリ 1 つがカバーするサイズ（n = 1..=4）
const fn level_size(level: u8) -> u64 {
    PAGE_SIZE << (9 * (level as u64 - 1))
}

/// このレベルで終端（リーフ）を置けるか
const fn leaf_allowed(level: u8) -> bool {
    matches!(level, 1 | 2 | 3)
}

fn table_index(level: u8, addr: u64) -> usize {
    let va = VirtAddr::new_truncate(addr);
    let idx = match level {
        4 => va.p4_index(),
        3 => va.p3_index(),
        2 => va.p2_index(),
        _ => va.p1_index(),
    };
    usize::from(idx)
}

/// 1 つの second-stage ページテーブル（ルート = L4）
#[derive(Debug)]
pub struct PageTable {
    root: PageIndex,
}

impl PageTable {
    pub fn new(pool: &mut PagePool) -> Result<Self, PagingError> {
        let root = pool.alloc().ok_or(PagingError::OutOfPageTableCapacity)?;
        Ok(PageTable { root })
    }

    pub fn root_phys(&self, pool: &PagePool) -> PhysAddr {
        pool.phys_of(self.root)
    }

    fn read(pool: &PagePool, table: PageIndex, idx: usize, level: u8) -> Result<Entry, PagingError> {
        let raw = pool.page(table).0[idx];
        let flags = EntryFlags::from_bits_truncate(raw);
        if !flags.intersects(EntryFlags::ACCESS) {
            return Ok(Entry::Invalid);
        }
        let phys = raw & ADDR_MASK;
        if level == 1 || (leaf_allowed(level) && flags.contains(EntryFlags::HUGE)) {
            return Ok(Entry::Leaf { phys, flags });
        }
        match pool.index_of(PhysAddr(phys)) {
            Some(next) => Ok(Entry::Table(next)),
            None => Err(PagingError::CorruptTable),
        }
    }

    fn write(pool: &mut PagePool, table: PageIndex, idx: usize, raw: u64) {
        pool.page_mut(table).0[idx] = raw;
    }

    fn leaf_raw(level: u8, phys: u64, flags: EntryFlags) -> u64 {
        let mut flags = flags - EntryFlags::HUGE;
        if level > 1 {
            flags |= EntryFlags::HUGE;
        }
        (phys & ADDR_MASK) | flags.bits()
    }

    fn is_empty(pool: &PagePool, table: PageIndex) -> bool {
        pool.page(table).0.iter().all(|e| *e == 0)
    }

    /// [guest, guest+size) を [phys, phys+size) へ `flags` でマップする。
    ///
    /// 失敗時に途中までのエントリが残る場合がある。呼び出し側は同じ範囲を
    /// unmap して巻き戻すこと（自分で張った範囲の unmap は分割を必要としない）。
    pub fn map(
        &self,
        pool: &mut PagePool,
        guest: GuestAddr,
        phys: PhysAddr,
        size: u64,
        flags: EntryFlags,
    ) -> Result<(), PagingError> {
        if !guest.is_page_aligned() || !phys.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(PagingError::Misaligned);
        }
        Self::map_level(pool, self.root, 4, guest.0, phys.0, size, flags)
    }

    fn map_level(
        pool: &mut PagePool,
        table: PageIndex,
        level: u8,
        guest: u64,
        phys: u64,
        size: u64,
        flags: EntryFlags,
    ) -> Result<(), PagingError> {
        let entry_size = level_size(level);
        let end = guest + size;
        let (mut g, mut p) = (guest, phys);

        while g < end {
            let idx = table_index(level, g);
            let entry_base = g & !(entry_size - 1);
            let chunk = (entry_base + entry_size).min(end) - g;
            let entry = Self::read(pool, table, idx, level)?;

            let whole_entry = g == entry_base && chunk == entry_size && p % entry_size == 0;
            if leaf_allowed(level) && whole_entry {
                // 細かいマッピングが残っていれば先に解体して大ページへ置き換える
                if let Entry::Table(next) = entry {
                    Self::free_subtree(pool, next, level - 1)?;
                }
                Self::write(pool, table, idx, Self::leaf_raw(level, p, flags));
            } else {
                let next = match entry {
                    Entry::Table(next) => next,
                    Entry::Leaf { phys: leaf_phys, flags: leaf_flags } => {
                        Self::split(pool, table, idx, level, leaf_phys, leaf_flags)?
                    }
                    Entry::Invalid => {
                        let next = pool.alloc().ok_or(PagingError::OutOfPageTableCapacity)?;
                        let raw = pool.phys_of(next).0 | EntryFlags::TABLE.bits();
                        Self::write(pool, table, idx, raw);
                        next
                    }
                };
                Self::map_level(pool, next, level - 1, g, p, chunk, flags)?;
            }

            g += chunk;
            p += chunk;
        }
        Ok(())
    }

    /// 大ページを 1 段下の 512 エントリへ分割し、新テーブルを返す。
    fn split(
        pool: &mut PagePool,
        table: PageIndex,
        idx: usize,
        level: u8,
        leaf_phys: u64,
        leaf_flags: EntryFlags,
    ) -> Result<PageIndex, PagingError> {
        let next = pool.alloc().ok_or(PagingError::OutOfPageTableCapacity)?;
        let sub_size = level_size(level - 1);
        for n in 0..ENTRIES {
            let raw = Self::leaf_raw(level - 1, leaf_phys + n as u64 * sub_size, leaf_flags);
            Self::write(pool, next, n, raw);
        }
        let raw = pool.phys_of(next).0 | EntryFlags::TABLE.bits();
        Self::write(pool, table, idx, raw);
        Ok(next)
    }

    /// [guest, guest+size) のマッピングを外す。未マップ部分は無視する。
    pub fn unmap(&self, pool: &mut PagePool, guest: GuestAddr, size: u64) -> Result<(), PagingError> {
        if !guest.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(PagingError::Misaligned);
        }
        Self::unmap_level(pool, self.root, 4, guest.0, size)
    }

    fn unmap_level(
        pool: &mut PagePool,
        table: PageIndex,
        level: u8,
        guest: u64,
        size: u64,
    ) -> Result<(), PagingError> {
        let entry_size = level_size(level);
        let end = guest + size;
        let mut g = guest;

        while g < end {
            let idx = table_index(level, g);
            let entry_base = g & !(entry_size - 1);
            let chunk = (entry_base + entry_size).min(end) - g;
            let covers_entry = g == entry_base && chunk == entry_size;

            match Self::read(pool, table, idx, level)? {
                Entry::Invalid => {}
                Entry::Leaf { .. } if covers_entry => Self::write(pool, table, idx, 0),
                Entry::Leaf { phys, flags } => {
                    let next = Self::split(pool, table, idx, level, phys, flags)?;
                    Self::unmap_level(pool, next, level - 1, g, chunk)?;
                }
                Entry::Table(next) => {
                    Self::unmap_level(pool, next, level - 1, g, chunk)?;
                    if Self::is_empty(pool, next) {
                        Self::write(pool, table, idx, 0);
                        pool.free(next);
                    }
                }
            }
            g += chunk;
        }
        Ok(())
    }

    /// ゲスト物理アドレスを引く。未マップなら None。
    pub fn translate(&self, pool: &PagePool, guest: GuestAddr) -> Option<(PhysAddr, EntryFlags)> {
        let mut table = self.root;
        let mut level = 4u8;
        loop {
            let idx = table_index(level, guest.0);
            match Self::read(pool, table, idx, level).ok()? {
                Entry::Invalid => return None,
                Entry::Leaf { phys, flags } => {
                    let offset = guest.0 & (level_size(level) - 1);
                    return Some((PhysAddr(phys + offset), flags));
                }
                Entry::Table(next) => {
                    table = next;
                    level -= 1;
                }
            }
        }
    }

    /// このテーブルが使っているページ数（ルート含む）
    pub fn table_pages(&self, pool: &PagePool) -> usize {
        Self::count_level(pool, self.root, 4)
    }

    fn count_level(pool: &PagePool, table: PageIndex, level: u8) -> usize {
        let mut count = 1;
        if level > 1 {
            for idx in 0..ENTRIES {
                if let Ok(Entry::Table(next)) = Self::read(pool, table, idx, level) {
                    count += Self::count_level(pool, next, level - 1);
                }
            }
        }
        count
    }

    fn free_subtree(pool: &mut PagePool, table: PageIndex, level: u8) -> Result<(), PagingError> {
        if level > 1 {
            for idx in 0..ENTRIES {
                if let Entry::Table(next) = Self::read(pool, table, idx, level)? {
                    Self::free_subtree(pool, next, level - 1)?;
                }
            }
        }
        pool.free(table);
        Ok(())
    }

    /// テーブルをすべてプールへ返す（リーフが指す先はプール外なので触らない）
    pub fn destroy(self, pool: &mut PagePool) {
        if Self::free_subtree(pool, self.root, 4).is_err() {
            crate::logging::error("INVARIANT VIOLATION: corrupt second-stage table on destroy");
        }
    }
}

#[cfg(test)]
#[path = "paging_test.rs"]
mod paging_test;
