// src/mm/address_space.rs
//
// 役割:
// - セル 1 つ分の second-stage 変換状態を表現する。
// - どのゲスト範囲がどの物理範囲にどの権限でコミットされているかを論理リストで保持し、
//   実テーブル（CPU 用 / I/O-MMU 用）を同期させる。
//
// やること:
// - commit_region: 検査（境界・重なり・属性の組合せ・アドレス幅）→ テーブル反映。
//   途中失敗は自分で巻き戻して「何も起きなかった」状態で返す。
// - revoke_region: 論理リストから外し、テーブルから外す。TLB 無効化要求を立てる。
// - map_range / unmap_range: 論理リストを触らない生の操作（ルートセルの切り出し・書き戻し用）。
//
// やらないこと:
// - セル間の重なり検査（ライフサイクル側が全セルを見て行う）。
// - TLB 無効化そのもの（arch::Platform::commit_second_stage）。

use crate::mem::addr::{GuestAddr, PhysAddr};
use crate::mem::region::{MemFlags, MemoryRegion};
use crate::mm::paging::{EntryFlags, PageTable, PagingError};
use crate::mm::PagePool;

/// 論理リストの容量（設定上の領域 + 通信ページ + 仮想 CPU IF）
const MAX_COMMITTED: usize = crate::types::MAX_MEM_REGIONS + 4;

/// アクセス種別（translate の権限判定用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// コミット済み領域 1 つ（backing は解決済みの物理アドレス）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Committed {
    pub region: MemoryRegion,
    pub backing: PhysAddr,
}

pub struct AddressSpace {
    stage2: PageTable,
    dma: PageTable,
    committed: [Option<Committed>; MAX_COMMITTED],
    /// ルートテーブルの物理アドレス（生存中は不変なのでプール無しで引けるように保持）
    stage2_phys: PhysAddr,
    dma_phys: PhysAddr,
    phys_addr_bits: u8,
    needs_flush: bool,
}

/// 属性の組合せを second-stage エントリへ 1 対 1 で写す。
///
/// 表現できない組合せ（W のみ / X のみ / DMA なのに R も W もない 等）は拒否する。
pub fn entry_flags_for(flags: MemFlags) -> Result<EntryFlags, PagingError> {
    let r = flags.contains(MemFlags::READ);
    let w = flags.contains(MemFlags::WRITE);
    let x = flags.contains(MemFlags::EXECUTE);

    if !r && (w || x) {
        return Err(PagingError::UnsupportedAccessCombination);
    }
    if !r && !w && !x && !flags.contains(MemFlags::COMM_REGION) {
        return Err(PagingError::UnsupportedAccessCombination);
    }
    if flags.contains(MemFlags::COMM_REGION) && flags.intersects(MemFlags::DMA | MemFlags::IO | MemFlags::LOADABLE) {
        return Err(PagingError::UnsupportedAccessCombination);
    }
    if flags.contains(MemFlags::IO) && flags.contains(MemFlags::LOADABLE) {
        return Err(PagingError::UnsupportedAccessCombination);
    }

    let mut entry = EntryFlags::empty();
    if r || flags.contains(MemFlags::COMM_REGION) {
        entry |= EntryFlags::READ;
    }
    if w || flags.contains(MemFlags::COMM_REGION) {
        entry |= EntryFlags::WRITE;
    }
    if x {
        entry |= EntryFlags::EXECUTE;
    }
    if !flags.contains(MemFlags::IO) {
        entry |= EntryFlags::MEMTYPE_WB | EntryFlags::IGNORE_PAT;
    }
    Ok(entry)
}

/// I/O-MMU 側は R/W だけを写す（実行権は意味を持たない）
fn dma_flags_for(flags: MemFlags) -> EntryFlags {
    let mut entry = EntryFlags::empty();
    if flags.contains(MemFlags::READ) {
        entry |= EntryFlags::READ;
    }
    if flags.contains(MemFlags::WRITE) {
        entry |= EntryFlags::WRITE;
    }
    entry
}

impl AddressSpace {
    pub fn new(pool: &mut PagePool, phys_addr_bits: u8) -> Result<Self, PagingError> {
        let stage2 = PageTable::new(pool)?;
        let dma = match PageTable::new(pool) {
            Ok(dma) => dma,
            Err(e) => {
                stage2.destroy(pool);
                return Err(e);
            }
        };
        Ok(AddressSpace {
            stage2_phys: stage2.root_phys(pool),
            dma_phys: dma.root_phys(pool),
            stage2,
            dma,
            committed: [None; MAX_COMMITTED],
            phys_addr_bits,
            needs_flush: false,
        })
    }

    pub fn stage2_root(&self) -> PhysAddr {
        self.stage2_phys
    }

    pub fn dma_root(&self) -> PhysAddr {
        self.dma_phys
    }

    /// 前回の commit_second_stage 以降にテーブルが変わったか（読み出しで要求を消費する）
    pub fn take_flush_request(&mut self) -> bool {
        core::mem::replace(&mut self.needs_flush, false)
    }

    pub fn committed_count(&self) -> usize {
        self.committed.iter().filter(|c| c.is_some()).count()
    }

    pub fn for_each_committed<F: FnMut(&Committed)>(&self, mut f: F) {
        for entry in self.committed.iter().flatten() {
            f(entry);
        }
    }

    /// 領域を検査だけする（副作用なし）。ライフサイクル側の事前検証で使う。
    pub fn check_region(&self, region: &MemoryRegion, backing: PhysAddr) -> Result<(), PagingError> {
        if region.size == 0
            || !region.guest_start.is_page_aligned()
            || !backing.is_page_aligned()
            || region.is_subpage()
        {
            return Err(PagingError::Misaligned);
        }
        entry_flags_for(region.flags)?;
        if !backing.fits_width(region.size, self.phys_addr_bits)
            || region.guest_start.0.checked_add(region.size).is_none()
        {
            return Err(PagingError::AddressWidthExceeded);
        }
        if self
            .committed
            .iter()
            .flatten()
            .any(|c| c.region.overlaps_guest(region))
        {
            return Err(PagingError::OverlapsExistingRegion);
        }
        if self.committed.iter().all(|c| c.is_some()) {
            return Err(PagingError::TooManyRegions);
        }
        Ok(())
    }

    /// 領域をコミットする。成功後は属性が許すアクセスだけが通る。
    pub fn commit_region(
        &mut self,
        pool: &mut PagePool,
        region: &MemoryRegion,
        backing: PhysAddr,
    ) -> Result<(), PagingError> {
        self.check_region(region, backing)?;
        let flags = entry_flags_for(region.flags)?;
        let slot = self
            .committed
            .iter()
            .position(|c| c.is_none())
            .ok_or(PagingError::TooManyRegions)?;

        if let Err(e) = self.stage2.map(pool, region.guest_start, backing, region.size, flags) {
            self.rollback(pool, region, false);
            return Err(e);
        }
        if region.flags.contains(MemFlags::DMA) {
            if let Err(e) = self.dma.map(pool, region.guest_start, backing, region.size, dma_flags_for(region.flags)) {
                self.rollback(pool, region, true);
                return Err(e);
            }
        }

        self.committed[slot] = Some(Committed {
            region: *region,
            backing,
        });
        self.needs_flush = true;
        Ok(())
    }

    fn rollback(&mut self, pool: &mut PagePool, region: &MemoryRegion, dma_too: bool) {
        // 自分で張ったリーフだけなので分割は起きない
        let _ = self.stage2.unmap(pool, region.guest_start, region.size);
        if dma_too {
            let _ = self.dma.unmap(pool, region.guest_start, region.size);
        }
    }

    /// コミット済み領域を外す。到達可能な変換は残さない（TLB 無効化要求を立てる）。
    pub fn revoke_region(&mut self, pool: &mut PagePool, region: &MemoryRegion) -> Result<(), PagingError> {
        let slot = self
            .committed
            .iter()
            .position(|c| matches!(c, Some(c) if c.region == *region))
            .ok_or(PagingError::NotCommitted)?;

        self.stage2.unmap(pool, region.guest_start, region.size)?;
        if region.flags.contains(MemFlags::DMA) {
            self.dma.unmap(pool, region.guest_start, region.size)?;
        }
        self.committed[slot] = None;
        self.needs_flush = true;
        Ok(())
    }

    /// 論理リストを触らずにマップする（ルートセルへの書き戻し・loadable 用）
    pub fn map_range(&mut self, pool: &mut PagePool, region: &MemoryRegion) -> Result<(), PagingError> {
        let backing = region.phys_start.ok_or(PagingError::UnsupportedAccessCombination)?;
        let flags = entry_flags_for(region.flags)?;
        self.stage2.map(pool, region.guest_start, backing, region.size, flags)?;
        if region.flags.contains(MemFlags::DMA) {
            self.dma.map(pool, region.guest_start, backing, region.size, dma_flags_for(region.flags))?;
        }
        self.needs_flush = true;
        Ok(())
    }

    /// 論理リストを触らずに外す（ルートセルからの切り出し用）。
    /// 大ページの分割でプールを使うことがある。
    pub fn unmap_range(&mut self, pool: &mut PagePool, guest: GuestAddr, size: u64) -> Result<(), PagingError> {
        self.stage2.unmap(pool, guest, size)?;
        self.dma.unmap(pool, guest, size)?;
        self.needs_flush = true;
        Ok(())
    }

    /// ゲストのアクセスが second-stage を通るならホスト物理アドレスを返す。
    pub fn translate(&self, pool: &PagePool, guest: GuestAddr, access: AccessKind) -> Option<PhysAddr> {
        let (phys, flags) = self.stage2.translate(pool, guest)?;
        let needed = match access {
            AccessKind::Read => EntryFlags::READ,
            AccessKind::Write => EntryFlags::WRITE,
            AccessKind::Execute => EntryFlags::EXECUTE,
        };
        flags.contains(needed).then_some(phys)
    }

    /// デバイス DMA が I/O-MMU を通るか
    pub fn dma_translate(&self, pool: &PagePool, guest: GuestAddr, write: bool) -> Option<PhysAddr> {
        let (phys, flags) = self.dma.translate(pool, guest)?;
        let needed = if write { EntryFlags::WRITE } else { EntryFlags::READ };
        flags.contains(needed).then_some(phys)
    }

    pub fn table_pages(&self, pool: &PagePool) -> usize {
        self.stage2.table_pages(pool) + self.dma.table_pages(pool)
    }

    pub fn destroy(self, pool: &mut PagePool) {
        self.stage2.destroy(pool);
        self.dma.destroy(pool);
    }
}

#[cfg(test)]
#[path = "address_space_test.rs"]
mod address_space_test;
