// src/control/cell.rs
//
// 役割:
// - セル 1 つ分の実体（設定・CPU 集合・割り込み線・second-stage・トラップ表・通信ページ）。
//
// やること:
// - build: 設定から実体を組み立てる。途中で失敗したら作りかけを自分で片付ける。
// - teardown: テーブル・通信ページをプールへ返す。
//
// やらないこと:
// - 他セルとの関係（ルートからの切り出し / 書き戻し）は lifecycle.rs が扱う。

use crate::config::{CellConfig, CellFlags, PlatformInfo};
use crate::control::comm::{self, CommRegion, CommState, COMM_FLAG_DBG_PUTC_ACTIVE, COMM_FLAG_DBG_PUTC_PERMITTED};
use crate::error::{HvError, TrapError};
use crate::irq::irqchip::DIST_SIZE;
use crate::logging;
use crate::mem::addr::{GuestAddr, PhysAddr};
use crate::mem::region::{MemFlags, MemoryRegion};
use crate::mm::address_space::AddressSpace;
use crate::mm::paging::PagingError;
use crate::mm::{PageIndex, PagePool};
use crate::mmio::pci::{self, CONFIG_SPACE_SIZE};
use crate::mmio::{TrapHandler, TrapRegion, TrapTable};
use crate::types::{CellId, CpuSet, IrqSet};

/// セルのライフサイクル
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellState {
    /// 作成済み。CPU は Parked で所属だけ移っている
    Created,
    /// loadable 領域がルートセルから書ける
    Loadable,
    Running,
    ShuttingDown,
    Destroyed,
}

pub struct Cell {
    pub id: CellId,
    pub config: CellConfig,
    pub state: CellState,
    /// 現在の CPU 集合（ルートセルはセル作成のたびに減る）
    pub cpus: CpuSet,
    /// 現在所有している割り込み線
    pub irqs: IrqSet,
    pub memory: AddressSpace,
    pub traps: TrapTable,
    pub comm_page: Option<PageIndex>,
    /// loadable 領域が今ルートセルへ写っているか
    pub loadable: bool,
}

/// 仮想 CPU インタフェースの窓（プラットフォームが持っていれば）
pub fn vcpu_interface_region(platform: &PlatformInfo) -> Option<MemoryRegion> {
    (platform.vcpu_if_size != 0).then_some(MemoryRegion {
        phys_start: Some(PhysAddr(platform.vcpu_if_phys)),
        guest_start: GuestAddr(platform.vcpu_if_guest),
        size: platform.vcpu_if_size,
        flags: MemFlags::READ | MemFlags::WRITE | MemFlags::IO,
    })
}

impl Cell {
    pub fn build(
        id: CellId,
        config: &CellConfig,
        pool: &mut PagePool,
        platform: &PlatformInfo,
    ) -> Result<Cell, HvError> {
        let memory = AddressSpace::new(pool, platform.phys_addr_bits)?;
        let mut cell = Cell {
            id,
            config: config.clone(),
            state: CellState::Created,
            cpus: config.cpus,
            irqs: config.irqs(),
            memory,
            traps: TrapTable::new(),
            comm_page: None,
            loadable: false,
        };
        if let Err(e) = cell.populate(pool, platform) {
            cell.teardown(pool);
            return Err(e);
        }
        Ok(cell)
    }

    fn populate(&mut self, pool: &mut PagePool, platform: &PlatformInfo) -> Result<(), HvError> {
        for region in self.config.regions() {
            if region.is_comm_region() {
                let page = pool.alloc().ok_or(PagingError::OutOfPageTableCapacity)?;
                self.comm_page = Some(page);
                let backing = pool.phys_of(page);
                self.memory.commit_region(pool, region, backing)?;
                let initial = if self.id.is_root() {
                    CommState::Running
                } else {
                    CommState::ShutDown
                };
                let flags = self.comm_flags();
                comm::region_mut(pool, page).init(initial, flags, platform.pci_mmconfig_base);
            } else if region.is_subpage() {
                let phys = region.phys_start.ok_or(HvError::InvalidArgument)?;
                self.traps.register(TrapRegion {
                    start: region.guest_start.0,
                    size: region.size,
                    handler: TrapHandler::Subpage {
                        phys_base: phys.0,
                        flags: region.flags,
                    },
                })?;
            } else {
                let phys = region.phys_start.ok_or(HvError::InvalidArgument)?;
                self.memory.commit_region(pool, region, phys)?;
            }
        }

        if !self.config.irqchips().is_empty() {
            for chip in self.config.irqchips() {
                // 同じ distributor を複数の記述子で分けて書くことがある
                match self.traps.register(TrapRegion {
                    start: chip.address,
                    size: DIST_SIZE,
                    handler: TrapHandler::IrqChip {
                        phys_base: chip.address,
                    },
                }) {
                    Ok(()) | Err(TrapError::Duplicate) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if let Some(vcpu_if) = vcpu_interface_region(platform) {
                self.memory.commit_region(pool, &vcpu_if, PhysAddr(platform.vcpu_if_phys))?;
            }
        }

        if platform.pci_mmconfig_base != 0 {
            let base = platform.pci_mmconfig_base;
            self.traps.register(TrapRegion {
                start: base,
                size: pci::window_size(platform.pci_mmconfig_end_bus),
                handler: TrapHandler::PciWindow,
            })?;
            for device in self.config.pci_devices() {
                let start = base + pci::bdf_offset(device.bdf);
                self.traps.register(TrapRegion {
                    start,
                    size: CONFIG_SPACE_SIZE,
                    handler: TrapHandler::PciDevice {
                        phys_base: start,
                        bdf: device.bdf,
                    },
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn comm_flags(&self) -> u32 {
        let mut flags = 0;
        if self.config.flags.contains(CellFlags::VIRTUAL_CONSOLE_PERMITTED) {
            flags |= COMM_FLAG_DBG_PUTC_PERMITTED;
        }
        if self.config.flags.contains(CellFlags::VIRTUAL_CONSOLE_ACTIVE) {
            flags |= COMM_FLAG_DBG_PUTC_ACTIVE;
        }
        flags
    }

    /// 通信ページ（無ければ None）
    pub fn comm<'a>(&self, pool: &'a mut PagePool) -> Option<&'a mut CommRegion> {
        self.comm_page.map(|page| comm::region_mut(pool, page))
    }

    /// ルートセル以外で、デバッグコンソールへの出力を許されているか
    pub fn may_putc(&self) -> bool {
        self.id.is_root() || self.config.flags.contains(CellFlags::VIRTUAL_CONSOLE_PERMITTED)
    }

    pub fn teardown(mut self, pool: &mut PagePool) {
        self.traps.clear();
        if let Some(page) = self.comm_page.take() {
            pool.free(page);
        }
        self.memory.destroy(pool);
        logging::info_u64("cell: released, id", self.id.0 as u64);
    }
}
