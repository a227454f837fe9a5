// src/config/mod.rs
//
// 役割:
// - セル設定記述子 / システム設定記述子を検証して、固定容量の所有型へ変換する。
//
// やること:
// - ヘッダ → シグネチャ → リビジョン → 名前 → 各要素数（容量と実サイズ）の順に検査し、
//   要素に触るのは全件数の検査が通ってから。
// - 領域の属性・境界、CPU 集合、割り込み線範囲の静的検査。
//
// やらないこと:
// - 他セルとの重なり検査（その時点のセル構成を知っている control 側が行う）。

pub mod layout;

use zerocopy::FromBytes;

use crate::mem::addr::{is_page_aligned, GuestAddr, PhysAddr, PAGE_SIZE};
use crate::mem::region::{MemFlags, MemoryRegion};
use crate::types::{
    CpuSet, IrqSet, MAX_CPUS, MAX_IRQCHIPS, MAX_IRQS, MAX_MEM_REGIONS, MAX_PCI_DEVICES,
};

use layout::{
    CacheDesc, CellDescHeader, IrqChipDesc, MemoryDesc, PciCapDesc, PciDeviceDesc, PioDesc,
    SystemDescHeader, CELL_NAME_LEN, CELL_SIGNATURE, CONFIG_REVISION, SYSTEM_SIGNATURE,
};

/// 1 つの記述子として受け付ける最大サイズ
pub const MAX_CONFIG_SIZE: usize = 4 * PAGE_SIZE as usize;

/// 物理 backing を持たないことを示す phys_start
pub const UNBACKED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// 記述子が宣言サイズより短い
    Truncated,
    BadSignature,
    BadRevision,
    /// 名前が NUL 終端されていない / UTF-8 でない / 空
    InvalidName,
    /// 要素数が固定容量を超える
    TooManyElements,
    /// 記述子全体が MAX_CONFIG_SIZE を超える
    TooBig,
    EmptyCpuSet,
    CpuOutOfRange,
    /// index 番目のメモリ領域が不正
    InvalidRegion(usize),
    MultipleCommRegions,
    /// index 番目の irqchip が割り込み線範囲を超える
    InvalidIrqChip(usize),
}

bitflags::bitflags! {
    /// セル属性
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CellFlags: u32 {
        /// 通信ページでの応答を待たない
        const PASSIVE_COMMREG = 0x0000_0001;
        const TEST_DEVICE = 0x0000_0002;
        const VIRTUAL_CONSOLE_PERMITTED = 0x4000_0000;
        const VIRTUAL_CONSOLE_ACTIVE = 0x8000_0000;
    }
}

/// NUL 終端を剥がしたセル名
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CellName {
    bytes: [u8; CELL_NAME_LEN],
    len: usize,
}

impl CellName {
    fn parse(raw: &[u8; CELL_NAME_LEN]) -> Result<Self, ConfigError> {
        let len = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or(ConfigError::InvalidName)?;
        if len == 0 || core::str::from_utf8(&raw[..len]).is_err() {
            return Err(ConfigError::InvalidName);
        }
        Ok(CellName { bytes: *raw, len })
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("?")
    }
}

impl core::fmt::Debug for CellName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// 割り込みコントローラ記述子（distributor の窓 + 所有する割り込み線）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqChip {
    pub address: u64,
    pub id: u32,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

impl IrqChip {
    pub fn irqs(&self) -> IrqSet {
        let mut set = IrqSet::EMPTY;
        for (n, word) in self.pin_bitmap.iter().enumerate() {
            let Some(first) = self.pin_base.checked_add(32 * n as u32) else {
                break;
            };
            set.insert_word(first, *word);
        }
        set
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciDeviceKind {
    Device,
    Bridge,
    Ivshmem,
    Unknown(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciDevice {
    pub kind: PciDeviceKind,
    pub domain: u16,
    pub bdf: u16,
    pub iommu: u8,
    pub bar_mask: [u32; 6],
}

/// 検証済みのセル設定（固定容量・所有型）
#[derive(Clone, Debug)]
pub struct CellConfig {
    pub name: CellName,
    pub flags: CellFlags,
    pub cpus: CpuSet,
    regions: [MemoryRegion; MAX_MEM_REGIONS],
    num_regions: usize,
    irqchips: [IrqChip; MAX_IRQCHIPS],
    num_irqchips: usize,
    pci_devices: [PciDevice; MAX_PCI_DEVICES],
    num_pci_devices: usize,
    pub vpci_irq_base: u32,
    pub cpu_reset_address: u64,
    pub msg_reply_timeout: u64,
}

const EMPTY_REGION: MemoryRegion = MemoryRegion {
    phys_start: None,
    guest_start: GuestAddr(0),
    size: 0,
    flags: MemFlags::empty(),
};

const EMPTY_IRQCHIP: IrqChip = IrqChip {
    address: 0,
    id: 0,
    pin_base: 0,
    pin_bitmap: [0; 4],
};

const EMPTY_PCI: PciDevice = PciDevice {
    kind: PciDeviceKind::Unknown(0),
    domain: 0,
    bdf: 0,
    iommu: 0,
    bar_mask: [0; 6],
};

/// 記述子を先頭から順に読むカーソル
struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<T: FromBytes>(&mut self) -> Result<T, ConfigError> {
        let (value, rest) = T::read_from_prefix(self.rest).map_err(|_| ConfigError::Truncated)?;
        self.rest = rest;
        Ok(value)
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], ConfigError> {
        if self.rest.len() < len {
            return Err(ConfigError::Truncated);
        }
        let (head, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(head)
    }
}

/// ヘッダの要素数から記述子全体のサイズを出す（オーバーフローは TooBig）
pub fn cell_config_size(header: &CellDescHeader) -> Result<usize, ConfigError> {
    use core::mem::size_of;
    let parts = [
        (1u64, size_of::<CellDescHeader>() as u64),
        (header.cpu_set_size as u64, 1),
        (header.num_memory_regions as u64, size_of::<MemoryDesc>() as u64),
        (header.num_cache_regions as u64, size_of::<CacheDesc>() as u64),
        (header.num_irqchips as u64, size_of::<IrqChipDesc>() as u64),
        (header.num_pio_regions as u64, size_of::<PioDesc>() as u64),
        (header.num_pci_devices as u64, size_of::<PciDeviceDesc>() as u64),
        (header.num_pci_caps as u64, size_of::<PciCapDesc>() as u64),
    ];
    let mut total = 0u64;
    for (count, size) in parts {
        total = count
            .checked_mul(size)
            .and_then(|bytes| total.checked_add(bytes))
            .ok_or(ConfigError::TooBig)?;
    }
    usize::try_from(total).map_err(|_| ConfigError::TooBig)
}

fn check_header(header: &CellDescHeader) -> Result<(), ConfigError> {
    let signature = header.signature;
    if signature != CELL_SIGNATURE {
        return Err(ConfigError::BadSignature);
    }
    if header.revision != CONFIG_REVISION {
        return Err(ConfigError::BadRevision);
    }
    if header.num_memory_regions as usize > MAX_MEM_REGIONS
        || header.num_irqchips as usize > MAX_IRQCHIPS
        || header.num_pci_devices as usize > MAX_PCI_DEVICES
        || header.cpu_set_size as u64 > PAGE_SIZE
    {
        return Err(ConfigError::TooManyElements);
    }
    Ok(())
}

fn parse_cpu_set(bytes: &[u8]) -> Result<CpuSet, ConfigError> {
    let mut bits = 0u64;
    for (n, byte) in bytes.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        if n >= MAX_CPUS / 8 {
            return Err(ConfigError::CpuOutOfRange);
        }
        bits |= (*byte as u64) << (8 * n);
    }
    if bits == 0 {
        return Err(ConfigError::EmptyCpuSet);
    }
    Ok(CpuSet::from_bits(bits))
}

fn parse_region(desc: &MemoryDesc, index: usize) -> Result<MemoryRegion, ConfigError> {
    let flags = MemFlags::from_bits(desc.flags).ok_or(ConfigError::InvalidRegion(index))?;
    let phys_start = if flags.contains(MemFlags::COMM_REGION) || desc.phys_start == UNBACKED {
        None
    } else {
        Some(PhysAddr(desc.phys_start))
    };
    let region = MemoryRegion {
        phys_start,
        guest_start: GuestAddr(desc.virt_start),
        size: desc.size,
        flags,
    };

    if region.size == 0 || region.guest_start.0.checked_add(region.size).is_none() {
        return Err(ConfigError::InvalidRegion(index));
    }
    if let Some(phys) = phys_start {
        if phys.0.checked_add(region.size).is_none() {
            return Err(ConfigError::InvalidRegion(index));
        }
    }

    // sub-page は IO_UNALIGNED 付きの MMIO だけ許す
    let aligned = is_page_aligned(desc.virt_start)
        && is_page_aligned(desc.size)
        && phys_start.map_or(true, |p| p.is_page_aligned());
    let subpage_ok = flags.contains(MemFlags::IO | MemFlags::IO_UNALIGNED) && phys_start.is_some();
    if !aligned && !subpage_ok {
        return Err(ConfigError::InvalidRegion(index));
    }
    if phys_start.is_none() && !region.is_comm_region() {
        return Err(ConfigError::InvalidRegion(index));
    }
    if region.is_comm_region() && region.size != PAGE_SIZE {
        return Err(ConfigError::InvalidRegion(index));
    }
    Ok(region)
}

impl CellConfig {
    /// セル記述子を検証して取り込む。戻り値の usize は消費したバイト数。
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ConfigError> {
        let mut reader = Reader { rest: bytes };
        let header: CellDescHeader = reader.take()?;
        check_header(&header)?;

        let total = cell_config_size(&header)?;
        if total > MAX_CONFIG_SIZE {
            return Err(ConfigError::TooBig);
        }
        if bytes.len() < total {
            return Err(ConfigError::Truncated);
        }
        let name_raw = header.name;
        let name = CellName::parse(&name_raw)?;

        // ここから先は全件数が実サイズに収まっていることが保証されている
        let cpus = parse_cpu_set(reader.take_bytes(header.cpu_set_size as usize)?)?;

        let mut regions = [EMPTY_REGION; MAX_MEM_REGIONS];
        let mut comm_regions = 0;
        for (n, slot) in regions
            .iter_mut()
            .enumerate()
            .take(header.num_memory_regions as usize)
        {
            let desc: MemoryDesc = reader.take()?;
            *slot = parse_region(&desc, n)?;
            if slot.is_comm_region() {
                comm_regions += 1;
            }
        }
        if comm_regions > 1 {
            return Err(ConfigError::MultipleCommRegions);
        }

        for _ in 0..header.num_cache_regions {
            let _: CacheDesc = reader.take()?;
        }

        let mut irqchips = [EMPTY_IRQCHIP; MAX_IRQCHIPS];
        for (n, slot) in irqchips
            .iter_mut()
            .enumerate()
            .take(header.num_irqchips as usize)
        {
            let desc: IrqChipDesc = reader.take()?;
            let chip = IrqChip {
                address: desc.address,
                id: desc.id,
                pin_base: desc.pin_base,
                pin_bitmap: desc.pin_bitmap,
            };
            // ビットマップが空でも pin_base は線範囲に収める（irqs() の加算が溢れない）
            if chip.pin_base as usize + 128 > MAX_IRQS {
                return Err(ConfigError::InvalidIrqChip(n));
            }
            *slot = chip;
        }

        for _ in 0..header.num_pio_regions {
            let _: PioDesc = reader.take()?;
        }

        let mut pci_devices = [EMPTY_PCI; MAX_PCI_DEVICES];
        for slot in pci_devices.iter_mut().take(header.num_pci_devices as usize) {
            let desc: PciDeviceDesc = reader.take()?;
            *slot = PciDevice {
                kind: match desc.device_type {
                    1 => PciDeviceKind::Device,
                    2 => PciDeviceKind::Bridge,
                    3 => PciDeviceKind::Ivshmem,
                    other => PciDeviceKind::Unknown(other),
                },
                domain: desc.domain,
                bdf: desc.bdf,
                iommu: desc.iommu,
                bar_mask: desc.bar_mask,
            };
        }

        for _ in 0..header.num_pci_caps {
            let _: PciCapDesc = reader.take()?;
        }

        let config = CellConfig {
            name,
            flags: CellFlags::from_bits_retain(header.flags),
            cpus,
            regions,
            num_regions: header.num_memory_regions as usize,
            irqchips,
            num_irqchips: header.num_irqchips as usize,
            pci_devices,
            num_pci_devices: header.num_pci_devices as usize,
            vpci_irq_base: header.vpci_irq_base,
            cpu_reset_address: header.cpu_reset_address,
            msg_reply_timeout: header.msg_reply_timeout,
        };
        Ok((config, total))
    }

    /// 記述子の先頭だけを見て全体サイズを返す（ゲストメモリからのコピー量決定用）
    pub fn peek_size(header_bytes: &[u8]) -> Result<usize, ConfigError> {
        let (header, _) =
            CellDescHeader::read_from_prefix(header_bytes).map_err(|_| ConfigError::Truncated)?;
        check_header(&header)?;
        let total = cell_config_size(&header)?;
        if total > MAX_CONFIG_SIZE {
            return Err(ConfigError::TooBig);
        }
        Ok(total)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions[..self.num_regions]
    }

    pub fn irqchips(&self) -> &[IrqChip] {
        &self.irqchips[..self.num_irqchips]
    }

    pub fn pci_devices(&self) -> &[PciDevice] {
        &self.pci_devices[..self.num_pci_devices]
    }

    pub fn comm_region(&self) -> Option<&MemoryRegion> {
        self.regions().iter().find(|r| r.is_comm_region())
    }

    /// irqchip 記述子が宣言する割り込み線の和集合
    pub fn irqs(&self) -> IrqSet {
        let mut set = IrqSet::EMPTY;
        for chip in self.irqchips() {
            set.union_with(&chip.irqs());
        }
        set
    }
}

/// プラットフォーム情報（検証済み）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformInfo {
    pub pci_mmconfig_base: u64,
    pub pci_mmconfig_end_bus: u8,
    pub maintenance_irq: u32,
    pub phys_addr_bits: u8,
    pub num_irqs: u32,
    pub irqchip_base: u64,
    pub vcpu_if_phys: u64,
    pub vcpu_if_guest: u64,
    pub vcpu_if_size: u64,
}

/// 検証済みのシステム設定（ルートセル記述子を含む）
#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub flags: u32,
    pub hypervisor_memory: MemoryRegion,
    pub platform: PlatformInfo,
    pub root_cell: CellConfig,
}

impl SystemConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut reader = Reader { rest: bytes };
        let header: SystemDescHeader = reader.take()?;
        let signature = header.signature;
        if signature != SYSTEM_SIGNATURE {
            return Err(ConfigError::BadSignature);
        }
        if header.revision != CONFIG_REVISION {
            return Err(ConfigError::BadRevision);
        }

        let hv = header.hypervisor_memory;
        let platform = header.platform;
        let phys_addr_bits = match platform.phys_addr_bits {
            0 => 48,
            bits => bits.min(52),
        };
        let num_irqs = match platform.num_irqs {
            0 => MAX_IRQS as u32,
            n => n.min(MAX_IRQS as u32),
        };

        let (root_cell, _) = CellConfig::parse(reader.rest)?;
        Ok(SystemConfig {
            flags: header.flags,
            hypervisor_memory: MemoryRegion {
                phys_start: Some(PhysAddr(hv.phys_start)),
                guest_start: GuestAddr(hv.virt_start),
                size: hv.size,
                flags: MemFlags::from_bits_truncate(hv.flags),
            },
            platform: PlatformInfo {
                pci_mmconfig_base: platform.pci_mmconfig_base,
                pci_mmconfig_end_bus: platform.pci_mmconfig_end_bus,
                maintenance_irq: platform.maintenance_irq as u32,
                phys_addr_bits,
                num_irqs,
                irqchip_base: platform.irqchip_base,
                vcpu_if_phys: platform.vcpu_if_phys,
                vcpu_if_guest: platform.vcpu_if_guest,
                vcpu_if_size: platform.vcpu_if_size,
            },
            root_cell,
        })
    }
}
