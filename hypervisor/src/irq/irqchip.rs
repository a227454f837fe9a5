// src/irq/irqchip.rs
//
// 割り込みコントローラ distributor の窓を模倣する（GICv2 のレジスタ配置）。
//
// 方針:
// - セルが所有する割り込み線に対応するビット / バイトだけを実物へ通す。
//   所有していない線のビットは読み出しで 0、書き込みで無視。
// - SGI / PPI（0..31）は CPU ごとにバンクされるので全セルが触れる。
// - ソフトウェア生成割り込み（SGIR）は実物へ書かず、セル内 CPU への仮想割り込みに変える。
// - 制御レジスタ（CTLR 等）への書き込みはルートセルだけが実物へ通せる。

use crate::arch::Platform;
use crate::control::Hypervisor;
use crate::irq::{SignalTarget, FIRST_SHARED_IRQ};
use crate::logging;
use crate::mem::addr::PhysAddr;
use crate::mmio::{MmioAccess, MmioResult};
use crate::types::{CpuId, CpuSet, IrqId, IrqSet};

/// distributor の窓の大きさ
pub const DIST_SIZE: u64 = 0x1000;

const GICD_CTLR_END: u64 = 0x0080;
const GICD_BITS_START: u64 = 0x0100;
const GICD_BITS_END: u64 = 0x0400;
const GICD_IPRIORITYR: u64 = 0x0400;
const GICD_ITARGETSR: u64 = 0x0800;
const GICD_ICFGR: u64 = 0x0C00;
const GICD_ICFGR_END: u64 = 0x0D00;
const GICD_SGIR: u64 = 0x0F00;

const SGIR_FILTER_LIST: u64 = 0;
const SGIR_FILTER_OTHERS: u64 = 1;
const SGIR_FILTER_SELF: u64 = 2;

/// 窓内のアクセス 1 回を扱うための、セル側の見え方
struct CellView {
    is_root: bool,
    irqs: IrqSet,
    cpus: CpuSet,
}

impl CellView {
    fn owns(&self, irq: u32) -> bool {
        irq < FIRST_SHARED_IRQ || self.irqs.contains(IrqId(irq))
    }

    /// first_irq から bits_per_irq ビットずつ並ぶレジスタのうち、所有分のマスク
    fn mask(&self, first_irq: u32, bits_per_irq: u32, size: u8) -> u64 {
        let count = (size as u32 * 8) / bits_per_irq;
        let field = (1u64 << bits_per_irq) - 1;
        (0..count)
            .filter(|n| self.owns(first_irq + n))
            .fold(0u64, |mask, n| mask | (field << (n * bits_per_irq)))
    }
}

fn passthrough_masked<P: Platform>(platform: &P, phys: PhysAddr, access: &MmioAccess, mask: u64) -> MmioResult {
    if access.is_write {
        let full = crate::mmio::width_mask(access.size);
        let value = if mask == full {
            access.value
        } else {
            let old = platform.mmio_read(phys, access.size);
            (old & !mask) | (access.value & mask)
        };
        if mask != 0 {
            platform.mmio_write(phys, access.size, value);
        }
        MmioResult::Handled(None)
    } else {
        MmioResult::Handled(Some(platform.mmio_read(phys, access.size) & mask))
    }
}

impl<P: Platform> Hypervisor<P> {
    pub(crate) fn irqchip_access(&self, cpu: CpuId, access: &MmioAccess, phys_base: u64) -> MmioResult {
        let Some(percpu) = self.percpu(cpu) else {
            return MmioResult::Error;
        };
        let cell_id = percpu.cell();
        let view = {
            let slot = self.cells[cell_id.index()].read();
            let Some(cell) = slot.as_ref() else {
                return MmioResult::Error;
            };
            CellView {
                is_root: cell_id.is_root(),
                irqs: cell.irqs,
                cpus: cell.cpus,
            }
        };

        let offset = access.offset;
        let phys = PhysAddr(phys_base + offset);

        match offset {
            0..GICD_CTLR_END => {
                if access.is_write {
                    if view.is_root {
                        self.platform.mmio_write(phys, access.size, access.value);
                    }
                    MmioResult::Handled(None)
                } else {
                    MmioResult::Handled(Some(self.platform.mmio_read(phys, access.size)))
                }
            }
            GICD_BITS_START..GICD_BITS_END => {
                if access.size != 4 {
                    return MmioResult::Error;
                }
                let first_irq = ((offset & 0x7F) / 4) as u32 * 32;
                let mask = view.mask(first_irq, 1, 4);
                passthrough_masked(&self.platform, phys, access, mask)
            }
            GICD_IPRIORITYR..GICD_ICFGR => {
                if access.size != 1 && access.size != 4 {
                    return MmioResult::Error;
                }
                let base = if offset >= GICD_ITARGETSR {
                    GICD_ITARGETSR
                } else {
                    GICD_IPRIORITYR
                };
                let first_irq = (offset - base) as u32;
                let mask = view.mask(first_irq, 8, access.size);
                if base == GICD_ITARGETSR && access.is_write {
                    // 宛先はセル内の CPU に限る
                    let cpus = (view.cpus.bits() & 0xFF) as u8;
                    let allowed = u64::from_ne_bytes([cpus; 8]);
                    let restricted = MmioAccess {
                        value: access.value & allowed,
                        ..*access
                    };
                    return passthrough_masked(&self.platform, phys, &restricted, mask);
                }
                passthrough_masked(&self.platform, phys, access, mask)
            }
            GICD_ICFGR..GICD_ICFGR_END => {
                if access.size != 4 {
                    return MmioResult::Error;
                }
                let first_irq = ((offset - GICD_ICFGR) / 4) as u32 * 16;
                let mask = view.mask(first_irq, 2, 4);
                passthrough_masked(&self.platform, phys, access, mask)
            }
            GICD_SGIR => {
                if access.size != 4 {
                    return MmioResult::Error;
                }
                if !access.is_write {
                    return MmioResult::Handled(Some(0));
                }
                let sgi = IrqId((access.value & 0xF) as u32);
                let target = match (access.value >> 24) & 0x3 {
                    SGIR_FILTER_LIST => SignalTarget::Cpus(CpuSet::from_bits((access.value >> 16) & 0xFF)),
                    SGIR_FILTER_OTHERS => SignalTarget::AllOthers,
                    SGIR_FILTER_SELF => SignalTarget::ToSelf,
                    _ => return MmioResult::Error,
                };
                match self.cell_signal(cpu, sgi, target) {
                    Ok(_) => MmioResult::Handled(None),
                    Err(_) => MmioResult::Error,
                }
            }
            _ => {
                if access.is_write {
                    logging::warn_hex("irqchip: ignored write, offset", offset);
                    MmioResult::Handled(None)
                } else {
                    MmioResult::Handled(Some(0))
                }
            }
        }
    }
}
