// src/control/lifecycle.rs
//
// 役割:
// - セルの作成 / loadable 化 / 開始 / 破棄と、ハイパーバイザ全体の停止。
// - 状態取得系の管理操作（セル状態・CPU 情報・ハイパーバイザ情報）。
//
// 約束:
// - 構成を変える操作は registry ロックの下で 1 つずつ。取れなければ Busy。
// - 呼び出し元 CPU はルートセルに属していること（それ以外は PermissionDenied）。
// - 検証はすべて最初の副作用より前に行う。途中で失敗したら、CPU の再開も含めて元に戻す。
// - メンバーシップを変える前に、関係する CPU を全員 Suspended にする（all-or-nothing）。
// - 実行中のセルには通信ページで SHUTDOWN_REQUEST を送り、了承を得てから止める。
//
// やらないこと:
// - CPU の状態遷移そのもの（percpu.rs。ここは要求を出すだけ）。
// - ページテーブルの中身の操作（mm::address_space）。

use crate::arch::{EventKind, Platform};
use crate::config::{CellConfig, CellFlags};
use crate::control::cell::{Cell, CellState};
use crate::control::comm::{self, CommState, Message, Verdict};
use crate::control::percpu::CpuState;
use crate::control::Hypervisor;
use crate::error::{ControlError, HvError};
use crate::irq::FIRST_SHARED_IRQ;
use crate::logging;
use crate::mem::addr::{page_align_up, GuestAddr, PhysAddr, PAGE_MASK, PAGE_SIZE};
use crate::mem::region::{MemFlags, MemoryRegion};
use crate::mm::address_space::AccessKind;
use crate::mm::paging::PagingError;
use crate::mm::PagePool;
use crate::types::{CellId, CpuId, CpuSet, IrqId, IrqSet, MAX_CELLS, MAX_MEM_REGIONS};

/// cpu_get_info の種別
pub const CPU_INFO_STATE: u64 = 0;
pub const CPU_INFO_STAT_BASE: u64 = 1000;

/// cpu_get_info(STATE) の値
pub const CPU_RUNNING: i64 = 0;
pub const CPU_FAILED: i64 = 2;

/// hypervisor_get_info の種別
pub const INFO_MEM_POOL_SIZE: u64 = 0;
pub const INFO_MEM_POOL_USED: u64 = 1;
pub const INFO_REMAP_POOL_SIZE: u64 = 2;
pub const INFO_REMAP_POOL_USED: u64 = 3;
pub const INFO_NUM_CELLS: u64 = 4;

// ─────────────────────────────────────────────
// ルートセルのマッピング操作
// ─────────────────────────────────────────────

/// 領域をページ境界へ広げる（sub-page 領域はそのページ全体を扱う）
fn page_span(region: &MemoryRegion) -> MemoryRegion {
    let guest = region.guest_start.0 & PAGE_MASK;
    let end = page_align_up(region.guest_end());
    MemoryRegion {
        phys_start: region.phys_start.map(|p| PhysAddr(p.0 - (region.guest_start.0 - guest))),
        guest_start: GuestAddr(guest),
        size: end - guest,
        flags: region.flags,
    }
}

/// ルートセル側で `region` と物理的に重なる部分（ルートのゲストアドレス・ルートの属性）
fn root_overlaps<'a>(root: &'a Cell, region: &'a MemoryRegion) -> impl Iterator<Item = MemoryRegion> + 'a {
    root.config
        .regions()
        .iter()
        .filter(|rr| !rr.is_comm_region() && !rr.is_subpage())
        .filter_map(move |rr| rr.phys_overlap(region))
        .map(|o| page_span(&o))
}

/// ルートセルの second-stage がまだ `region` の物理範囲のどこかを引けるか
pub(crate) fn root_maps(root: &Cell, pool: &PagePool, region: &MemoryRegion) -> bool {
    root_overlaps(root, region).any(|o| {
        let mut offset = 0;
        while offset < o.size {
            if root
                .memory
                .translate(pool, o.guest_start.offset(offset), AccessKind::Read)
                .is_some()
            {
                return true;
            }
            offset += PAGE_SIZE;
        }
        false
    })
}

/// 重なり計算の一時置き場（ルートセルの領域数で上限が決まる）
struct Spans {
    items: [Option<MemoryRegion>; MAX_MEM_REGIONS],
}

impl Spans {
    fn of(root: &Cell, region: &MemoryRegion) -> Self {
        let mut items = [None; MAX_MEM_REGIONS];
        for (slot, span) in items.iter_mut().zip(root_overlaps(root, region)) {
            *slot = Some(span);
        }
        Spans { items }
    }

    fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.items.iter().flatten()
    }
}

fn unmap_from_root(root: &mut Cell, pool: &mut PagePool, region: &MemoryRegion) -> Result<(), PagingError> {
    for span in Spans::of(root, region).iter() {
        root.memory.unmap_range(pool, span.guest_start, span.size)?;
    }
    Ok(())
}

fn remap_to_root(root: &mut Cell, pool: &mut PagePool, region: &MemoryRegion) -> Result<(), PagingError> {
    for span in Spans::of(root, region).iter() {
        root.memory.map_range(pool, span)?;
    }
    Ok(())
}

/// ルートセルから切り出す対象か（通信ページはプール由来、共有宣言は切り出さない）
fn carved_from_root(region: &MemoryRegion) -> bool {
    !region.is_comm_region() && !region.flags.contains(MemFlags::ROOTSHARED)
}

/// 共有割り込み線だけを残す（SGI / PPI は CPU ごとの線なのでセル間で移らない）
fn shared_irqs(set: &IrqSet) -> IrqSet {
    let mut shared = *set;
    for n in 0..FIRST_SHARED_IRQ {
        shared.remove(IrqId(n));
    }
    shared
}

impl<P: Platform> Hypervisor<P> {
    fn caller_cell(&self, caller: CpuId) -> Result<CellId, HvError> {
        Ok(self.percpu(caller).ok_or(ControlError::InvalidCpu)?.cell())
    }

    fn require_root(&self, caller: CpuId) -> Result<(), HvError> {
        if self.caller_cell(caller)?.is_root() {
            Ok(())
        } else {
            Err(HvError::PermissionDenied)
        }
    }

    /// 非ルートの生存セル（管理操作の対象）
    fn target_cell(&self, id: CellId) -> Result<(), HvError> {
        if id.is_root() {
            return Err(HvError::InvalidArgument);
        }
        if self.live_cells().any(|c| c == id) {
            Ok(())
        } else {
            Err(HvError::NotFound)
        }
    }

    fn comm_state(&self, id: CellId) -> Option<CommState> {
        let slot = self.cells.get(id.index())?.read();
        let cell = slot.as_ref()?;
        let mut pool = self.pool.lock();
        cell.comm(&mut pool).and_then(|c| c.state())
    }

    pub(crate) fn set_comm_state(&self, id: CellId, state: CommState) {
        if let Some(slot) = self.cells.get(id.index()) {
            if let Some(cell) = slot.read().as_ref() {
                let mut pool = self.pool.lock();
                if let Some(comm) = cell.comm(&mut pool) {
                    comm.set_state(state);
                }
            }
        }
    }

    /// RUNNING_LOCKED のセルが他にいれば再構成は拒否される
    fn reconfig_ok(&self, excluded: Option<CellId>) -> bool {
        self.live_cells()
            .filter(|id| !id.is_root() && Some(*id) != excluded)
            .all(|id| self.comm_state(id) != Some(CommState::RunningLocked))
    }

    /// 通信ページでメッセージを送り、返事を有限回待つ。了承なら true。
    fn send_message(&self, id: CellId, msg: Message) -> bool {
        let Some((page, passive, timeout)) = self.with_cell(id, |c| {
            (
                c.comm_page,
                c.config.flags.contains(CellFlags::PASSIVE_COMMREG),
                c.config.msg_reply_timeout,
            )
        }) else {
            return true;
        };
        let Some(page) = page else {
            return true;
        };
        if passive {
            return true;
        }

        {
            let mut pool = self.pool.lock();
            let region = comm::region_mut(&mut pool, page);
            if !region.header_intact() || region.state() == Some(CommState::FailedCommRev) {
                // リビジョンの合わないセルとは会話できない
                logging::error("cell: comm region revision mismatch, marking cell failed");
                region.set_state(CommState::Failed);
                return true;
            }
            region.post(msg);
        }

        let retries = match timeout {
            0 => self.tunables.msg_retries as u64,
            n => n,
        };
        for _ in 0..retries {
            let verdict = {
                let mut pool = self.pool.lock();
                let region = comm::region_mut(&mut pool, page);
                comm::judge(region.state(), region.reply(), msg)
            };
            match verdict {
                Verdict::Approved => return true,
                Verdict::Denied => return false,
                Verdict::Waiting => self.platform.cpu_relax(),
            }
        }
        logging::warn("cell: no reply on comm region, assuming approval");
        logging::info_u64(" cell", id.0 as u64);
        true
    }

    /// 作成・破棄のあと、全非ルートセルへ通知する（返事は問わない）
    fn reconfig_completed(&self) {
        for id in self.live_cells().filter(|id| !id.is_root()) {
            let _ = self.send_message(id, Message::ReconfigCompleted);
        }
    }

    /// テーブルが変わった CPU に次の再開で commit し直させる
    fn flush_cpus(&self, cpus: CpuSet) {
        for cpu in cpus.iter() {
            if let Some(percpu) = self.percpu(cpu) {
                percpu.request_flush();
                self.platform.send_event(cpu, EventKind::Management);
            }
        }
    }

    // ─────────────────────────────────────────────
    // create
    // ─────────────────────────────────────────────

    /// 事前検証。副作用は一切ない。成功なら新しいセル id を返す。
    fn validate_new_cell(&self, caller: CpuId, config: &CellConfig) -> Result<CellId, HvError> {
        if self.find_cell(config.name.as_str()).is_some() {
            return Err(HvError::AlreadyExists);
        }
        let id = (1..MAX_CELLS as u32)
            .map(CellId)
            .find(|id| !self.live_cells().any(|live| live == *id))
            .ok_or(HvError::NoMemory)?;

        let root_cpus = self.cell_cpus(CellId::ROOT);
        if config.cpus.is_empty() {
            return Err(HvError::InvalidArgument);
        }
        if config.cpus.contains(caller) || !config.cpus.is_subset_of(root_cpus) {
            return Err(HvError::Busy);
        }
        if config.cpus.iter().any(|cpu| self.cpu_state(cpu).map_or(true, |s| s == CpuState::Failed)) {
            return Err(ControlError::CpuFailed.into());
        }

        let regions = config.regions();
        for (n, region) in regions.iter().enumerate() {
            if regions[n + 1..].iter().any(|other| other.overlaps_guest(region)) {
                return Err(HvError::InvalidArgument);
            }
            if region.is_comm_region() {
                continue;
            }
            let Some(phys) = region.phys_start else {
                return Err(HvError::InvalidArgument);
            };
            let in_root = self.system.root_cell.regions().iter().any(|rr| rr.contains_phys(phys.0, region.size));
            if !in_root {
                logging::warn_hex("cell: region outside root cell memory", phys.0);
                return Err(HvError::InvalidArgument);
            }
        }

        for other in self.live_cells().filter(|id| !id.is_root()) {
            let conflict = self
                .with_cell(other, |c| {
                    let memory = c.config.regions().iter().any(|theirs| {
                        regions.iter().any(|ours| {
                            ours.overlaps_phys(theirs)
                                && !(ours.flags.contains(MemFlags::ROOTSHARED)
                                    && theirs.flags.contains(MemFlags::ROOTSHARED))
                        })
                    });
                    let pci = c
                        .config
                        .pci_devices()
                        .iter()
                        .any(|theirs| config.pci_devices().iter().any(|ours| ours.bdf == theirs.bdf));
                    (memory, pci)
                })
                .unwrap_or((false, false));
            match conflict {
                (true, _) => return Err(HvError::InvalidArgument),
                (_, true) => return Err(HvError::Busy),
                _ => {}
            }
        }

        let root_irqs = self.with_cell(CellId::ROOT, |c| c.irqs).unwrap_or(IrqSet::EMPTY);
        if !shared_irqs(&config.irqs()).is_subset_of(&root_irqs) {
            return Err(HvError::Busy);
        }
        Ok(id)
    }

    /// ルートの CPU が全員止まっている状態で、セルを組み立ててルートから切り出す。
    fn activate_new_cell(&self, id: CellId, config: &CellConfig) -> Result<(), HvError> {
        let mut root_slot = self.cells[CellId::ROOT.index()].write();
        let Some(root) = root_slot.as_mut() else {
            logging::error("INVARIANT VIOLATION: root cell missing");
            return Err(HvError::NotFound);
        };
        let mut pool = self.pool.lock();
        let cell = Cell::build(id, config, &mut pool, &self.system.platform)?;

        let carve = cell
            .config
            .regions()
            .iter()
            .filter(|r| carved_from_root(r))
            .try_for_each(|r| unmap_from_root(root, &mut pool, r));
        if let Err(e) = carve {
            for r in cell.config.regions().iter().filter(|r| carved_from_root(r)) {
                if remap_to_root(root, &mut pool, r).is_err() {
                    logging::error("cell: cannot restore root mapping");
                }
            }
            cell.teardown(&mut pool);
            return Err(e.into());
        }

        root.cpus = root.cpus.difference(cell.cpus);
        root.irqs.subtract(&shared_irqs(&cell.irqs));
        drop(pool);
        drop(root_slot);

        *self.cells[id.index()].write() = Some(cell);
        self.set_live(id, true);
        Ok(())
    }

    /// セルを作る。CPU は Parked のまま新しいセルへ移り、cell_start で動き出す。
    pub fn cell_create(&self, caller: CpuId, descriptor: &[u8]) -> Result<CellId, HvError> {
        let _registry = self.lock_registry()?;
        self.require_root(caller)?;

        let (config, _) = CellConfig::parse(descriptor)?;
        let id = self.validate_new_cell(caller, &config)?;
        if !self.reconfig_ok(None) {
            return Err(HvError::PermissionDenied);
        }

        let root_cpus = self.cell_cpus(CellId::ROOT);
        let suspended = self.suspend_cpus(root_cpus, Some(caller))?;
        if !config.cpus.is_subset_of(suspended) {
            // Failed の CPU は検証で弾いているので、ここへは来ない
            logging::error("INVARIANT VIOLATION: new cell cpu not suspended");
            self.resume_cpus(suspended);
            return Err(ControlError::InvalidState.into());
        }

        if let Err(e) = self.activate_new_cell(id, &config) {
            logging::warn("cell: create failed, root cell untouched");
            self.resume_cpus(suspended);
            return Err(e);
        }

        self.route_cell_irqs(id);
        // ルートの先頭 CPU が移ったかもしれない
        self.route_cell_irqs(CellId::ROOT);
        for cpu in config.cpus.iter() {
            if let Some(percpu) = self.percpu(cpu) {
                if percpu.assign(id).and_then(|()| percpu.request_park()).is_err() {
                    logging::error("INVARIANT VIOLATION: cannot hand cpu to new cell");
                }
            }
        }
        let stays_root = suspended.difference(config.cpus);
        for cpu in stays_root.iter() {
            if let Some(percpu) = self.percpu(cpu) {
                percpu.request_flush();
            }
        }
        self.flush_cpus(CpuSet::single(caller));
        self.resume_cpus(suspended);

        self.reconfig_completed();
        logging::info("cell: created");
        logging::info_u64(" id", id.0 as u64);
        self.pool.lock().dump_stats("after cell creation");
        Ok(id)
    }

    // ─────────────────────────────────────────────
    // set_loadable / start
    // ─────────────────────────────────────────────

    /// セルを止め、loadable 領域をルートセルから書けるようにする。
    pub fn cell_set_loadable(&self, caller: CpuId, id: CellId) -> Result<(), HvError> {
        let _registry = self.lock_registry()?;
        self.require_root(caller)?;
        self.target_cell(id)?;
        if !self.reconfig_ok(Some(id)) {
            return Err(HvError::PermissionDenied);
        }
        if !self.send_message(id, Message::ShutdownRequest) {
            return Err(HvError::PermissionDenied);
        }

        let suspended = self.suspend_cpus(self.cell_cpus(id), None)?;
        for cpu in suspended.iter() {
            if self.park_cpu(cpu).is_err() {
                logging::error("INVARIANT VIOLATION: suspended cpu refused park");
            }
        }
        let result = self.map_loadable(id);

        self.flush_cpus(self.cell_cpus(CellId::ROOT));
        self.resume_cpus(suspended);
        if result.is_ok() {
            logging::info_u64("cell: loadable, id", id.0 as u64);
        }
        result
    }

    /// loadable 領域をルートから外し、全 CPU をリセットアドレスから走らせる。
    pub fn cell_start(&self, caller: CpuId, id: CellId) -> Result<(), HvError> {
        let _registry = self.lock_registry()?;
        self.require_root(caller)?;
        self.target_cell(id)?;
        if !self.reconfig_ok(Some(id)) {
            return Err(HvError::PermissionDenied);
        }
        if !self.send_message(id, Message::ShutdownRequest) {
            return Err(HvError::PermissionDenied);
        }

        // loadable の取り外しはリセットと同時: ルートの CPU も止めてから外す
        let root_suspended = self.suspend_cpus(self.cell_cpus(CellId::ROOT), Some(caller))?;
        let suspended = match self.suspend_cpus(self.cell_cpus(id), None) {
            Ok(set) => set,
            Err(e) => {
                self.resume_cpus(root_suspended);
                return Err(e);
            }
        };

        let prepared = self.prepare_start(id);

        for cpu in root_suspended.iter() {
            if let Some(percpu) = self.percpu(cpu) {
                percpu.request_flush();
            }
        }
        self.flush_cpus(CpuSet::single(caller));
        self.resume_cpus(root_suspended);

        let result = prepared.and_then(|(entry, context)| {
            suspended.iter().try_for_each(|cpu| self.reset_cpu(cpu, entry, context))
        });
        self.resume_cpus(suspended);
        if result.is_ok() {
            logging::info_u64("cell: started, id", id.0 as u64);
        }
        result
    }

    fn map_loadable(&self, id: CellId) -> Result<(), HvError> {
        let mut root_slot = self.cells[CellId::ROOT.index()].write();
        let mut cell_slot = self.cells[id.index()].write();
        let (Some(root), Some(cell)) = (root_slot.as_mut(), cell_slot.as_mut()) else {
            return Err(HvError::NotFound);
        };
        let mut pool = self.pool.lock();
        if !cell.loadable {
            for r in cell.config.regions().iter().filter(|r| r.flags.contains(MemFlags::LOADABLE)) {
                remap_to_root(root, &mut pool, r)?;
            }
            cell.loadable = true;
        }
        if let Some(comm) = cell.comm(&mut pool) {
            comm.set_state(CommState::ShutDown);
        }
        cell.state = CellState::Loadable;
        Ok(())
    }

    /// loadable を外し、通信ページを初期化する。戻り値は (entry, context)。
    fn prepare_start(&self, id: CellId) -> Result<(u64, u64), HvError> {
        let mut root_slot = self.cells[CellId::ROOT.index()].write();
        let mut cell_slot = self.cells[id.index()].write();
        let (Some(root), Some(cell)) = (root_slot.as_mut(), cell_slot.as_mut()) else {
            return Err(HvError::NotFound);
        };
        let mut pool = self.pool.lock();
        if cell.loadable {
            for r in cell.config.regions().iter().filter(|r| r.flags.contains(MemFlags::LOADABLE)) {
                unmap_from_root(root, &mut pool, r)?;
            }
            cell.loadable = false;
        }
        let flags = cell.comm_flags();
        if let Some(comm) = cell.comm(&mut pool) {
            comm.init(CommState::Running, flags, self.system.platform.pci_mmconfig_base);
        }
        cell.state = CellState::Running;
        let context = cell.config.comm_region().map_or(0, |r| r.guest_start.0);
        Ok((cell.config.cpu_reset_address, context))
    }

    // ─────────────────────────────────────────────
    // destroy
    // ─────────────────────────────────────────────

    /// セルを壊し、CPU・メモリ・割り込み線をルートセルへ返す。
    ///
    /// 応答しない CPU があれば Failed に落として Unresponsive を返す（他の CPU は再開する）。
    /// Failed の CPU は以後の suspend から外れるので、もう一度呼べば破棄は進む。
    pub fn cell_destroy(&self, caller: CpuId, id: CellId) -> Result<(), HvError> {
        let _registry = self.lock_registry()?;
        self.require_root(caller)?;
        self.target_cell(id)?;
        if !self.reconfig_ok(Some(id)) {
            return Err(HvError::PermissionDenied);
        }
        if !self.send_message(id, Message::ShutdownRequest) {
            return Err(HvError::PermissionDenied);
        }

        let cell_cpus = self.cell_cpus(id);
        let root_suspended = self.suspend_cpus(self.cell_cpus(CellId::ROOT), Some(caller))?;
        let cell_suspended = match self.suspend_cpus(cell_cpus, None) {
            Ok(set) => set,
            Err(e) => {
                self.resume_cpus(root_suspended);
                return Err(e);
            }
        };

        {
            let mut root_slot = self.cells[CellId::ROOT.index()].write();
            let mut cell_slot = self.cells[id.index()].write();
            let mut pool = self.pool.lock();
            if let (Some(root), Some(mut cell)) = (root_slot.as_mut(), cell_slot.take()) {
                cell.state = CellState::ShuttingDown;
                for r in cell.config.regions().iter().filter(|r| carved_from_root(r)) {
                    if remap_to_root(root, &mut pool, r).is_err() {
                        logging::error("cell: cannot return region to root cell");
                    }
                }
                root.cpus = root.cpus.union(cell.cpus);
                root.irqs.union_with(&shared_irqs(&cell.irqs));
                cell.state = CellState::Destroyed;
                cell.teardown(&mut pool);
            }
            self.set_live(id, false);
        }
        self.route_cell_irqs(CellId::ROOT);

        for cpu in cell_cpus.iter() {
            let Some(percpu) = self.percpu(cpu) else {
                continue;
            };
            let mut parked = percpu.assign(CellId::ROOT);
            if parked.is_ok() && cell_suspended.contains(cpu) {
                parked = percpu.request_park();
            }
            if parked.is_err() {
                logging::error("INVARIANT VIOLATION: cannot return cpu to root cell");
            }
        }
        for cpu in root_suspended.iter() {
            if let Some(percpu) = self.percpu(cpu) {
                percpu.request_flush();
            }
        }
        self.flush_cpus(CpuSet::single(caller));
        self.resume_cpus(root_suspended.union(cell_suspended));

        self.reconfig_completed();
        logging::info_u64("cell: destroyed, id", id.0 as u64);
        self.pool.lock().dump_stats("after cell destruction");
        Ok(())
    }

    // ─────────────────────────────────────────────
    // 状態取得
    // ─────────────────────────────────────────────

    /// 通信ページ上のセル状態（RUNNING=0 / RUNNING_LOCKED=1 / SHUT_DOWN=2 / FAILED=3）
    pub fn cell_get_state(&self, caller: CpuId, id: CellId) -> Result<i64, HvError> {
        self.require_root(caller)?;
        if !self.live_cells().any(|c| c == id) {
            return Err(HvError::NotFound);
        }
        match self.comm_state(id) {
            Some(
                state @ (CommState::Running
                | CommState::RunningLocked
                | CommState::ShutDown
                | CommState::Failed),
            ) => Ok(state as i64),
            Some(CommState::FailedCommRev) => Err(HvError::InvalidArgument),
            None => match self.with_cell(id, |c| c.state) {
                Some(CellState::Running) => Ok(CommState::Running as i64),
                Some(_) => Ok(CommState::ShutDown as i64),
                None => Err(HvError::NotFound),
            },
        }
    }

    pub fn cpu_get_info(&self, caller: CpuId, cpu: CpuId, kind: u64) -> Result<i64, HvError> {
        let percpu = self.percpu(cpu).ok_or(HvError::InvalidArgument)?;
        let caller_cell = self.caller_cell(caller)?;
        if !caller_cell.is_root() && percpu.cell() != caller_cell {
            return Err(HvError::PermissionDenied);
        }
        match kind {
            CPU_INFO_STATE => Ok(if percpu.is_failed() { CPU_FAILED } else { CPU_RUNNING }),
            k if k >= CPU_INFO_STAT_BASE => percpu
                .stats
                .get((k - CPU_INFO_STAT_BASE) as usize)
                .map(|v| v as i64)
                .ok_or(HvError::InvalidArgument),
            _ => Err(HvError::InvalidArgument),
        }
    }

    /// 一時マップ用のプールは持たないので REMAP_POOL は 0
    pub fn hypervisor_get_info(&self, kind: u64) -> Result<i64, HvError> {
        let (total, used) = self.pool_usage();
        match kind {
            INFO_MEM_POOL_SIZE => Ok(total as i64),
            INFO_MEM_POOL_USED => Ok(used as i64),
            INFO_REMAP_POOL_SIZE | INFO_REMAP_POOL_USED => Ok(0),
            INFO_NUM_CELLS => Ok(self.num_cells() as i64),
            _ => Err(HvError::InvalidArgument),
        }
    }

    // ─────────────────────────────────────────────
    // disable
    // ─────────────────────────────────────────────

    /// 全セルの了承を取ってからハイパーバイザを止める。
    ///
    /// 非ルートセルの CPU、ルートセルの CPU の順にシャットダウン要求を出し、
    /// 呼び出し元 CPU はハイパーコールから戻るところで自分を止める。
    pub fn disable(&self, caller: CpuId) -> Result<(), HvError> {
        let _registry = self.lock_registry()?;
        self.require_root(caller)?;
        if self.is_disabled() {
            return Err(HvError::NotSupported);
        }

        let mut others = CpuSet::EMPTY;
        for id in self.live_cells().filter(|id| !id.is_root()) {
            if !self.send_message(id, Message::ShutdownRequest) {
                return Err(HvError::PermissionDenied);
            }
            others = others.union(self.cell_cpus(id));
        }
        let root_cpus = self.cell_cpus(CellId::ROOT);
        let suspended = self.suspend_cpus(others.union(root_cpus), Some(caller))?;

        for id in self.live_cells().filter(|id| !id.is_root()) {
            self.set_comm_state(id, CommState::ShutDown);
        }
        let non_root_first = suspended
            .iter()
            .filter(|cpu| others.contains(*cpu))
            .chain(suspended.iter().filter(|cpu| !others.contains(*cpu)));
        for cpu in non_root_first {
            if self.shutdown_cpu(cpu).is_err() {
                logging::error("INVARIANT VIOLATION: suspended cpu refused shutdown");
            }
        }
        if let Some(percpu) = self.percpu(caller) {
            percpu.shutdown_self();
        }
        self.set_disabled();
        self.resume_cpus(suspended);
        logging::info("hypervisor: disabled");
        Ok(())
    }
}
