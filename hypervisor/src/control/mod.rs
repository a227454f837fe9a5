// src/control/mod.rs
//
// ハイパーバイザ本体（全セル・全 CPU・ページプールを束ねる）。
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. メモリの分離
//    - ROOTSHARED で双方が共有を宣言したものを除き、物理範囲が 2 つのセルから同時に到達可能に
//      なることはない。ルートセルからは、他セルへ渡した範囲が切り出されている。
//
// 2. CPU の所属
//    - 各 CPU はちょうど 1 つのセルに属する。セルに属する Active な CPU の数は、
//      そのセルの CPU 集合の大きさを超えない。
//
// 3. 割り込み線の所有
//    - 共有割り込み線（32 以上）は高々 1 つのセルが所有する。
//
// 4. 管理操作の直列化
//    - セル構成を変える操作は registry ロックの下で 1 つずつ行う。
//      取れなければ待たずに Busy を返す。
//
// これらは debug_check_invariants() によってログ出力ベースで検証される。
//
// ロック順序: registry → セル（ルートが先、その後 id 順）→ ページプール
// CPU 制御ブロックのロックは他のロックを持ったまま長く保持しない。

pub mod cell;
pub mod comm;
pub mod entry;
pub mod lifecycle;
pub mod percpu;
pub mod trace;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use crate::arch::Platform;
use crate::config::SystemConfig;
use crate::error::HvError;
use crate::logging;
use crate::mem::addr::PhysAddr;
use crate::mem::region::MemFlags;
use crate::mm::{Page, PagePool};
use crate::types::{CellId, CpuId, CpuSet, MAX_CELLS, MAX_CPUS};

use cell::{Cell, CellState};
use percpu::{CpuState, PerCpu};

/// 有限待ちの回数（cpu_relax 1 回 = 1 回）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HvConfig {
    /// suspend 要求から Suspended 到達までの待ち
    pub suspend_retries: u32,
    /// 通信ページの返事待ち（セル設定の msg_reply_timeout が 0 のとき）
    pub msg_retries: u32,
}

impl Default for HvConfig {
    fn default() -> Self {
        HvConfig {
            suspend_retries: 1_000_000,
            msg_retries: 1_000_000,
        }
    }
}

pub struct Hypervisor<P: Platform> {
    pub(crate) platform: P,
    pub(crate) system: SystemConfig,
    pub(crate) tunables: HvConfig,
    pub(crate) cpus: [PerCpu; MAX_CPUS],
    pub(crate) cells: [RwLock<Option<Cell>>; MAX_CELLS],
    /// 生存セルのビット集合（registry ロック下でのみ更新）
    live: AtomicU32,
    registry: Mutex<()>,
    pub(crate) pool: Mutex<PagePool>,
    disabled: AtomicBool,
}

impl<P: Platform> Hypervisor<P> {
    /// システム設定を検証し、ルートセルを組み立てる。
    ///
    /// CPU はまだ誰も Active ではない。各 CPU が on_cpu_boot を呼んで参加する。
    pub fn new(
        platform: P,
        system_config: &[u8],
        pool_pages: &'static mut [Page],
        pool_phys: PhysAddr,
        tunables: HvConfig,
    ) -> Result<Self, HvError> {
        let system = SystemConfig::parse(system_config)?;
        let mut pool = PagePool::new(pool_pages, pool_phys);

        let mut root = Cell::build(CellId::ROOT, &system.root_cell, &mut pool, &system.platform)?;
        root.state = CellState::Running;

        let hv = Hypervisor {
            platform,
            tunables,
            cpus: core::array::from_fn(|i| PerCpu::new(CpuId(i as u32))),
            cells: core::array::from_fn(|_| RwLock::new(None)),
            live: AtomicU32::new(1 << CellId::ROOT.0),
            registry: Mutex::new(()),
            pool: Mutex::new(pool),
            disabled: AtomicBool::new(false),
            system,
        };
        *hv.cells[CellId::ROOT.index()].write() = Some(root);
        hv.route_cell_irqs(CellId::ROOT);

        logging::info("hypervisor: root cell configured");
        logging::info_u64(" root cpus", hv.system.root_cell.cpus.len() as u64);
        hv.pool.lock().dump_stats("after root cell");
        Ok(hv)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub(crate) fn percpu(&self, cpu: CpuId) -> Option<&PerCpu> {
        self.cpus.get(cpu.index())
    }

    pub(crate) fn live_cells(&self) -> impl Iterator<Item = CellId> {
        let live = self.live.load(Ordering::Acquire);
        (0..MAX_CELLS as u32)
            .filter(move |n| live & (1 << n) != 0)
            .map(CellId)
    }

    fn set_live(&self, cell: CellId, alive: bool) {
        if alive {
            self.live.fetch_or(1 << cell.0, Ordering::AcqRel);
        } else {
            self.live.fetch_and(!(1 << cell.0), Ordering::AcqRel);
        }
    }

    pub fn num_cells(&self) -> usize {
        self.live.load(Ordering::Acquire).count_ones() as usize
    }

    /// 管理操作の入口。別の操作が進行中なら待たずに Busy。
    fn lock_registry(&self) -> Result<MutexGuard<'_, ()>, HvError> {
        self.registry.try_lock().ok_or(HvError::Busy)
    }

    pub fn cell_cpus(&self, cell: CellId) -> CpuSet {
        self.cells
            .get(cell.index())
            .and_then(|slot| slot.read().as_ref().map(|c| c.cpus))
            .unwrap_or(CpuSet::EMPTY)
    }

    /// セルを読み取り専用で覗く
    pub fn with_cell<R>(&self, cell: CellId, f: impl FnOnce(&Cell) -> R) -> Option<R> {
        let slot = self.cells.get(cell.index())?.read();
        slot.as_ref().map(f)
    }

    /// 名前からセルを引く
    pub fn find_cell(&self, name: &str) -> Option<CellId> {
        self.live_cells()
            .find(|id| self.with_cell(*id, |c| c.config.name.as_str() == name) == Some(true))
    }

    pub fn pool_usage(&self) -> (usize, usize) {
        let pool = self.pool.lock();
        (pool.total_pages(), pool.used_pages())
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    fn set_disabled(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// 不変条件を検査し、違反をログへ出す。全部守られていれば true。
    pub fn debug_check_invariants(&self) -> bool {
        let mut ok = true;
        let cells: [Option<CellId>; MAX_CELLS] = {
            let mut out = [None; MAX_CELLS];
            for (slot, id) in out.iter_mut().zip(self.live_cells()) {
                *slot = Some(id);
            }
            out
        };

        // 2. CPU の所属
        for id in cells.iter().flatten() {
            let Some(set) = self.with_cell(*id, |c| c.cpus) else {
                continue;
            };
            let active = self
                .cpus
                .iter()
                .filter(|p| p.cell() == *id && p.state() == CpuState::Active)
                .count();
            if active > set.len() {
                logging::error("INVARIANT VIOLATION: more active cpus than the cell owns");
                ok = false;
            }
        }
        for (n, a) in cells.iter().flatten().enumerate() {
            for b in cells.iter().flatten().skip(n + 1) {
                if self.cell_cpus(*a).intersects(self.cell_cpus(*b)) {
                    logging::error("INVARIANT VIOLATION: cpu owned by two cells");
                    ok = false;
                }
                let irqs_a = self.with_cell(*a, |c| c.irqs);
                let irqs_b = self.with_cell(*b, |c| c.irqs);
                if let (Some(x), Some(y)) = (irqs_a, irqs_b) {
                    if x.iter().any(|irq| irq.0 >= crate::irq::FIRST_SHARED_IRQ && y.contains(irq)) {
                        logging::error("INVARIANT VIOLATION: irq owned by two cells");
                        ok = false;
                    }
                }
            }
        }

        // 1. メモリの分離（非ルートセル同士 / ルートからの切り出し）
        for (n, a) in cells.iter().flatten().enumerate() {
            if a.is_root() {
                continue;
            }
            for b in cells.iter().flatten().skip(n + 1) {
                let overlap = self
                    .with_cell(*a, |ca| {
                        self.with_cell(*b, |cb| {
                            ca.config.regions().iter().any(|ra| {
                                cb.config.regions().iter().any(|rb| {
                                    ra.overlaps_phys(rb)
                                        && !(ra.flags.contains(MemFlags::ROOTSHARED)
                                            && rb.flags.contains(MemFlags::ROOTSHARED))
                                })
                            })
                        })
                    })
                    .flatten()
                    .unwrap_or(false);
                if overlap {
                    logging::error("INVARIANT VIOLATION: memory reachable from two cells");
                    ok = false;
                }
            }
        }

        let root_slot = self.cells[CellId::ROOT.index()].read();
        if let Some(root) = root_slot.as_ref() {
            for a in cells.iter().flatten().filter(|id| !id.is_root()) {
                let slot = self.cells[a.index()].read();
                let Some(cell) = slot.as_ref() else {
                    continue;
                };
                let pool = self.pool.lock();
                let leaked = cell
                    .config
                    .regions()
                    .iter()
                    .filter(|r| !r.is_comm_region() && !r.flags.contains(MemFlags::ROOTSHARED))
                    .filter(|r| !(cell.loadable && r.flags.contains(MemFlags::LOADABLE)))
                    .any(|r| lifecycle::root_maps(root, &pool, r));
                if leaked {
                    logging::error("INVARIANT VIOLATION: root cell still maps a cell-owned range");
                    ok = false;
                }
            }
        }
        ok
    }
}
