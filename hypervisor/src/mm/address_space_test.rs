//! Tests for committing and revoking cell memory regions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;

use super::*;
use crate::mem::addr::PAGE_SIZE;
use crate::test_support::leak_pool;

fn region(phys: u64, guest: u64, size: u64, flags: MemFlags) -> MemoryRegion {
    MemoryRegion {
        phys_start: Some(PhysAddr(phys)),
        guest_start: GuestAddr(guest),
        size,
        flags,
    }
}

fn rw() -> MemFlags {
    MemFlags::READ | MemFlags::WRITE
}

#[test]
fn commit_allows_exactly_the_declared_accesses() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    let r = region(0x1000, 0x1000, 0x1000, rw());
    space.commit_region(&mut pool, &r, PhysAddr(0x1000)).unwrap();

    assert_eq!(
        space.translate(&pool, GuestAddr(0x1800), AccessKind::Write),
        Some(PhysAddr(0x1800))
    );
    assert!(space.translate(&pool, GuestAddr(0x1800), AccessKind::Read).is_some());
    assert!(space.translate(&pool, GuestAddr(0x1800), AccessKind::Execute).is_none());
    assert!(space.translate(&pool, GuestAddr(0x2000), AccessKind::Write).is_none());
    assert!(space.take_flush_request());
    assert!(!space.take_flush_request());
}

#[test]
fn overlapping_guest_range_is_rejected() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    space
        .commit_region(&mut pool, &region(0x10_0000, 0x10_0000, 0x4000, rw()), PhysAddr(0x10_0000))
        .unwrap();

    let clash = region(0x20_0000, 0x10_3000, 0x2000, rw());
    assert_eq!(
        space.commit_region(&mut pool, &clash, PhysAddr(0x20_0000)),
        Err(PagingError::OverlapsExistingRegion)
    );
    assert_eq!(space.committed_count(), 1);
}

#[test]
fn misaligned_and_bad_flags_are_rejected_before_mapping() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    let used = pool.used_pages();

    let misaligned = region(0x1000, 0x1800, 0x1000, rw());
    assert_eq!(
        space.commit_region(&mut pool, &misaligned, PhysAddr(0x1000)),
        Err(PagingError::Misaligned)
    );
    let write_only = region(0x1000, 0x1000, 0x1000, MemFlags::WRITE);
    assert_eq!(
        space.commit_region(&mut pool, &write_only, PhysAddr(0x1000)),
        Err(PagingError::UnsupportedAccessCombination)
    );
    let comm_dma = MemoryRegion {
        phys_start: None,
        guest_start: GuestAddr(0x8000),
        size: PAGE_SIZE,
        flags: MemFlags::COMM_REGION | MemFlags::DMA,
    };
    assert_eq!(
        space.commit_region(&mut pool, &comm_dma, PhysAddr(0x9000)),
        Err(PagingError::UnsupportedAccessCombination)
    );
    assert_eq!(pool.used_pages(), used);
}

#[test]
fn physical_range_must_fit_address_width() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 36).unwrap();
    let high = region(1 << 36, 0x1000, 0x1000, rw());
    assert_eq!(
        space.commit_region(&mut pool, &high, PhysAddr(1 << 36)),
        Err(PagingError::AddressWidthExceeded)
    );
    let edge = region((1 << 36) - 0x1000, 0x1000, 0x1000, rw());
    assert!(space
        .commit_region(&mut pool, &edge, PhysAddr((1 << 36) - 0x1000))
        .is_ok());
}

#[test]
fn dma_regions_are_mirrored_into_iommu_tables() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    let dma = region(0x40_0000, 0x40_0000, 0x2000, rw() | MemFlags::DMA);
    let cpu_only = region(0x80_0000, 0x80_0000, 0x1000, rw());
    space.commit_region(&mut pool, &dma, PhysAddr(0x40_0000)).unwrap();
    space.commit_region(&mut pool, &cpu_only, PhysAddr(0x80_0000)).unwrap();

    assert!(space.dma_translate(&pool, GuestAddr(0x40_1000), true).is_some());
    assert!(space.dma_translate(&pool, GuestAddr(0x80_0000), false).is_none());

    space.revoke_region(&mut pool, &dma).unwrap();
    assert!(space.dma_translate(&pool, GuestAddr(0x40_1000), true).is_none());
}

#[test]
fn failed_commit_leaves_no_partial_state() {
    // ルート 2 枚 + 1 枚しか残らないプール: L3/L2/L1 の 3 枚が必要な領域は失敗する
    let mut pool = leak_pool(3);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    let r = region(0x1000, 0x1000, 0x1000, rw());

    assert_eq!(
        space.commit_region(&mut pool, &r, PhysAddr(0x1000)),
        Err(PagingError::OutOfPageTableCapacity)
    );
    assert_eq!(pool.used_pages(), 2);
    assert_eq!(space.committed_count(), 0);
    assert!(space.translate(&pool, GuestAddr(0x1000), AccessKind::Read).is_none());
}

#[test]
fn revoke_of_unknown_region_fails() {
    let mut pool = leak_pool(8);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    assert_eq!(
        space.revoke_region(&mut pool, &region(0x1000, 0x1000, 0x1000, rw())),
        Err(PagingError::NotCommitted)
    );
}

#[test]
fn unmap_range_carves_out_of_a_huge_mapping() {
    let mut pool = leak_pool(32);
    let mut space = AddressSpace::new(&mut pool, 48).unwrap();
    let root_ram = region(0, 0, 0x4000_0000, rw() | MemFlags::EXECUTE);
    space.commit_region(&mut pool, &root_ram, PhysAddr(0)).unwrap();

    space.unmap_range(&mut pool, GuestAddr(0x1000_0000), 0x10_0000).unwrap();
    assert!(space.translate(&pool, GuestAddr(0x1000_0000), AccessKind::Read).is_none());
    assert!(space.translate(&pool, GuestAddr(0x1010_0000), AccessKind::Read).is_some());

    let back = region(0x1000_0000, 0x1000_0000, 0x10_0000, root_ram.flags);
    space.map_range(&mut pool, &back).unwrap();
    assert!(space.translate(&pool, GuestAddr(0x1000_0000), AccessKind::Read).is_some());
}

proptest! {
    // commit の直後に revoke すると、変換状態とプール使用量が元に戻る
    #[test]
    fn commit_then_revoke_restores_translation_state(
        guest_page in 0u64..0x4_0000,
        phys_page in 0u64..0x4_0000,
        pages in 1u64..600,
        dma in any::<bool>(),
    ) {
        let mut pool = leak_pool(64);
        let mut space = AddressSpace::new(&mut pool, 48).unwrap();
        let resident = region(0x8000_0000, 0x8000_0000, 0x20_0000, rw());
        space.commit_region(&mut pool, &resident, PhysAddr(0x8000_0000)).unwrap();

        let used_before = pool.used_pages();
        let tables_before = space.table_pages(&pool);
        let flags = if dma { rw() | MemFlags::DMA } else { rw() };
        let r = region(phys_page * PAGE_SIZE, guest_page * PAGE_SIZE, pages * PAGE_SIZE, flags);

        space.commit_region(&mut pool, &r, PhysAddr(phys_page * PAGE_SIZE)).unwrap();
        space.revoke_region(&mut pool, &r).unwrap();

        prop_assert_eq!(pool.used_pages(), used_before);
        prop_assert_eq!(space.table_pages(&pool), tables_before);
        prop_assert!(space.translate(&pool, r.guest_start, AccessKind::Read).is_none());
        prop_assert!(space.translate(&pool, GuestAddr(0x8000_0000), AccessKind::Write).is_some());
        prop_assert_eq!(space.committed_count(), 1);
    }
}
