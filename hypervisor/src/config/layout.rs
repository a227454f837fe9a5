// src/config/layout.rs
//
// 設定記述子のバイナリレイアウト（ビルド時ツールが生成する形式と一致させる）。
// - すべて packed、ネイティブエンディアン。
// - 読み出しは zerocopy::FromBytes::read_from_prefix でコピーして使う（アライメント不要）。
// - ここでは値の意味は解釈しない。検証と変換は config/mod.rs 側。

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const CELL_SIGNATURE: [u8; 6] = *b"JHCELL";
pub const SYSTEM_SIGNATURE: [u8; 6] = *b"JHSYST";
pub const CONFIG_REVISION: u16 = 11;
pub const CELL_NAME_LEN: usize = 32;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ConsoleDesc {
    pub address: u64,
    pub size: u32,
    pub flags: u32,
    pub divider: u32,
    pub gate_nr: u32,
    pub clock_reg: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CellDescHeader {
    pub signature: [u8; 6],
    pub revision: u16,
    pub name: [u8; CELL_NAME_LEN],
    pub id: u32,
    pub flags: u32,
    pub cpu_set_size: u32,
    pub num_memory_regions: u32,
    pub num_cache_regions: u32,
    pub num_irqchips: u32,
    pub num_pio_regions: u32,
    pub num_pci_devices: u32,
    pub num_pci_caps: u32,
    pub vpci_irq_base: u32,
    pub cpu_reset_address: u64,
    pub msg_reply_timeout: u64,
    pub console: ConsoleDesc,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemoryDesc {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CacheDesc {
    pub start: u32,
    pub size: u32,
    pub cache_type: u8,
    pub padding: u8,
    pub flags: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IrqChipDesc {
    pub address: u64,
    pub id: u32,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PioDesc {
    pub base: u16,
    pub length: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PciDeviceDesc {
    pub device_type: u8,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: u16,
    pub bar_mask: [u32; 6],
    pub caps_start: u16,
    pub num_caps: u16,
    pub num_msi_vectors: u8,
    pub msi_flags: u8,
    pub num_msix_vectors: u16,
    pub msix_region_size: u16,
    pub msix_address: u64,
    pub shmem_region: u32,
    pub shmem_protocol: u16,
    pub padding: [u8; 2],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PciCapDesc {
    pub id: u16,
    pub start: u16,
    pub len: u16,
    pub flags: u16,
}

/// プラットフォーム情報（アーキテクチャ非依存の部分だけ）
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PlatformDesc {
    pub pci_mmconfig_base: u64,
    pub pci_mmconfig_end_bus: u8,
    pub pci_is_virtual: u8,
    pub pci_domain: u16,
    pub maintenance_irq: u8,
    pub phys_addr_bits: u8,
    pub padding: [u8; 2],
    pub num_irqs: u32,
    /// 割り込みコントローラ distributor の物理ベース
    pub irqchip_base: u64,
    /// 仮想 CPU インタフェースの物理ベース / セルから見えるアドレス / サイズ
    pub vcpu_if_phys: u64,
    pub vcpu_if_guest: u64,
    pub vcpu_if_size: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SystemDescHeader {
    pub signature: [u8; 6],
    pub revision: u16,
    pub flags: u32,
    pub hypervisor_memory: MemoryDesc,
    pub debug_console: ConsoleDesc,
    pub platform: PlatformDesc,
}

// レイアウトの取り違えはコンパイル時に止める
const _: () = assert!(core::mem::size_of::<ConsoleDesc>() == 32);
const _: () = assert!(core::mem::size_of::<CellDescHeader>() == 128);
const _: () = assert!(core::mem::size_of::<MemoryDesc>() == 32);
const _: () = assert!(core::mem::size_of::<CacheDesc>() == 12);
const _: () = assert!(core::mem::size_of::<IrqChipDesc>() == 32);
const _: () = assert!(core::mem::size_of::<PioDesc>() == 4);
const _: () = assert!(core::mem::size_of::<PciDeviceDesc>() == 56);
const _: () = assert!(core::mem::size_of::<PciCapDesc>() == 8);
