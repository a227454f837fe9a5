// src/mmio/pci.rs
//
// PCI コンフィグ空間（MMCONFIG 窓）の扱い。
// - セルは窓全体をトラップとして持ち、所有デバイスだけを 4KiB 単位で個別登録する。
//   検索は最小の窓を選ぶので、所有デバイスへのアクセスは個別登録側へ落ちる。
// - 所有していないデバイス: 読み出しは全 1（デバイス不在に見える）、書き込みは捨てる。
// - 所有デバイス: 物理コンフィグ空間へそのまま中継する。

use crate::arch::Platform;
use crate::mem::addr::PhysAddr;
use crate::mmio::{MmioAccess, MmioResult};

/// 1 デバイス分のコンフィグ空間
pub const CONFIG_SPACE_SIZE: u64 = 0x1000;

/// bus/device/function → MMCONFIG 窓内のオフセット
pub const fn bdf_offset(bdf: u16) -> u64 {
    (bdf as u64) << 12
}

/// MMCONFIG 窓のサイズ（end_bus まで）
pub const fn window_size(end_bus: u8) -> u64 {
    (end_bus as u64 + 1) << 20
}

pub fn unowned_access(access: &MmioAccess) -> MmioResult {
    if access.is_write {
        MmioResult::Handled(None)
    } else {
        MmioResult::Handled(Some(u64::MAX))
    }
}

pub fn device_access<P: Platform>(platform: &P, access: &MmioAccess, phys_base: u64) -> MmioResult {
    let phys = PhysAddr(phys_base + access.offset);
    if access.is_write {
        platform.mmio_write(phys, access.size, access.value);
        MmioResult::Handled(None)
    } else {
        MmioResult::Handled(Some(platform.mmio_read(phys, access.size)))
    }
}
