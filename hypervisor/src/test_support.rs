//! Shared helpers for unit tests: leaked page pools, descriptor builders and
//! simulated CPUs.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use zerocopy::IntoBytes;

use crate::arch::mock::MockPlatform;
use crate::control::comm::{self, Message};
use crate::control::{HvConfig, Hypervisor};
use crate::types::{CellId, CpuId};

use crate::config::layout::{
    CellDescHeader, ConsoleDesc, IrqChipDesc, MemoryDesc, PciDeviceDesc, PlatformDesc,
    SystemDescHeader, CELL_SIGNATURE, CONFIG_REVISION, SYSTEM_SIGNATURE,
};
use crate::mem::addr::{PhysAddr, PAGE_SIZE};
use crate::mem::region::MemFlags;
use crate::mm::{Page, PagePool};

pub const POOL_PHYS_BASE: u64 = 0x7_0000_0000;

/// テスト用に静的寿命のページ配列を作ってプールにする
pub fn leak_pool(pages: usize) -> PagePool {
    let backing: &'static mut [Page] = Box::leak(vec![Page::ZERO; pages].into_boxed_slice());
    PagePool::new(backing, PhysAddr(POOL_PHYS_BASE))
}

pub fn leak_pages(pages: usize) -> &'static mut [Page] {
    Box::leak(vec![Page::ZERO; pages].into_boxed_slice())
}

/// セル記述子のバイト列を組み立てる
#[derive(Clone)]
pub struct CellDescBuilder {
    name: [u8; 32],
    flags: u32,
    cpu_set: Vec<u8>,
    regions: Vec<MemoryDesc>,
    irqchips: Vec<IrqChipDesc>,
    pci_devices: Vec<PciDeviceDesc>,
    cpu_reset_address: u64,
    msg_reply_timeout: u64,
}

impl CellDescBuilder {
    pub fn new(name: &str) -> Self {
        let mut raw = [0u8; 32];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        CellDescBuilder {
            name: raw,
            flags: 0,
            cpu_set: 0u64.to_ne_bytes().to_vec(),
            regions: Vec::new(),
            irqchips: Vec::new(),
            pci_devices: Vec::new(),
            cpu_reset_address: 0,
            msg_reply_timeout: 0,
        }
    }

    pub fn cpus(mut self, bits: u64) -> Self {
        self.cpu_set = bits.to_ne_bytes().to_vec();
        self
    }

    pub fn cpu_set_bytes(mut self, bytes: &[u8]) -> Self {
        self.cpu_set = bytes.to_vec();
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn reset_address(mut self, address: u64) -> Self {
        self.cpu_reset_address = address;
        self
    }

    pub fn msg_reply_timeout(mut self, retries: u64) -> Self {
        self.msg_reply_timeout = retries;
        self
    }

    pub fn region(mut self, phys: u64, virt: u64, size: u64, flags: MemFlags) -> Self {
        self.regions.push(MemoryDesc {
            phys_start: phys,
            virt_start: virt,
            size,
            flags: flags.bits(),
        });
        self
    }

    pub fn comm_region(self, virt: u64) -> Self {
        self.region(
            0,
            virt,
            PAGE_SIZE,
            MemFlags::READ | MemFlags::WRITE | MemFlags::COMM_REGION,
        )
    }

    pub fn raw_region_flags(mut self, index: usize, flags: u64) -> Self {
        self.regions[index].flags = flags;
        self
    }

    pub fn irqchip(mut self, address: u64, pin_base: u32, pin_bitmap: [u32; 4]) -> Self {
        self.irqchips.push(IrqChipDesc {
            address,
            id: 0,
            pin_base,
            pin_bitmap,
        });
        self
    }

    pub fn pci_device(mut self, bdf: u16) -> Self {
        self.pci_devices.push(PciDeviceDesc {
            device_type: 1,
            bdf,
            ..PciDeviceDesc::default()
        });
        self
    }

    pub fn header(&self) -> CellDescHeader {
        CellDescHeader {
            signature: CELL_SIGNATURE,
            revision: CONFIG_REVISION,
            name: self.name,
            id: 0,
            flags: self.flags,
            cpu_set_size: self.cpu_set.len() as u32,
            num_memory_regions: self.regions.len() as u32,
            num_cache_regions: 0,
            num_irqchips: self.irqchips.len() as u32,
            num_pio_regions: 0,
            num_pci_devices: self.pci_devices.len() as u32,
            num_pci_caps: 0,
            vpci_irq_base: 0,
            cpu_reset_address: self.cpu_reset_address,
            msg_reply_timeout: self.msg_reply_timeout,
            console: ConsoleDesc::default(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.header().as_bytes());
        out.extend_from_slice(&self.cpu_set);
        for r in &self.regions {
            out.extend_from_slice(r.as_bytes());
        }
        for c in &self.irqchips {
            out.extend_from_slice(c.as_bytes());
        }
        for p in &self.pci_devices {
            out.extend_from_slice(p.as_bytes());
        }
        out
    }
}

/// テスト用の既定プラットフォーム情報
pub fn platform_desc() -> PlatformDesc {
    PlatformDesc {
        pci_mmconfig_base: 0xe000_0000,
        pci_mmconfig_end_bus: 0,
        phys_addr_bits: 40,
        num_irqs: 256,
        irqchip_base: 0x0800_0000,
        vcpu_if_phys: 0x0804_0000,
        vcpu_if_guest: 0x0801_0000,
        vcpu_if_size: 0x2000,
        maintenance_irq: 25,
        ..PlatformDesc::default()
    }
}

pub fn system_desc(root: &CellDescBuilder, platform: PlatformDesc) -> Vec<u8> {
    let header = SystemDescHeader {
        signature: SYSTEM_SIGNATURE,
        revision: CONFIG_REVISION,
        flags: 0,
        hypervisor_memory: MemoryDesc {
            phys_start: 0x3c00_0000,
            virt_start: 0,
            size: 0x40_0000,
            flags: 0,
        },
        debug_console: ConsoleDesc::default(),
        platform,
    };
    let mut out = header.as_bytes().to_vec();
    out.extend_from_slice(&root.build());
    out
}

// ─────────────────────────────────────────────
// ハイパーバイザ一式と CPU ランナー
// ─────────────────────────────────────────────

pub type TestHv = Hypervisor<MockPlatform>;

/// ルートセルの RAM（1GiB、1:1。distributor / 仮想 CPU IF の窓とは重ならない）
pub const ROOT_RAM_BASE: u64 = 0x4000_0000;
pub const ROOT_RAM_SIZE: u64 = 0x4000_0000;
/// 既定の distributor
pub const DIST_BASE: u64 = 0x0800_0000;

/// 共有割り込み線 32..159 をすべて宣言した irqchip のビットマップ
pub const ALL_SPIS: [u32; 4] = [u32::MAX; 4];

/// CPU 0..4 と 1GiB の RAM を持つルートセル
pub fn root_cell() -> CellDescBuilder {
    CellDescBuilder::new("root")
        .cpus(0b1111)
        .region(
            ROOT_RAM_BASE,
            ROOT_RAM_BASE,
            ROOT_RAM_SIZE,
            MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::DMA,
        )
        .irqchip(DIST_BASE, 32, ALL_SPIS)
}

/// root の RAM から 1MiB を切り出す非ルートセル（割り込み線 50 を持つ）
pub fn guest_cell(name: &str, cpus: u64, ram_phys: u64) -> CellDescBuilder {
    CellDescBuilder::new(name)
        .cpus(cpus)
        .region(
            ram_phys,
            0,
            0x10_0000,
            MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::LOADABLE,
        )
        .comm_region(0x10_0000)
        .irqchip(DIST_BASE, 32, [1 << (50 - 32), 0, 0, 0])
        .msg_reply_timeout(200)
}

pub fn test_tunables() -> HvConfig {
    HvConfig {
        suspend_retries: 2_000_000,
        msg_retries: 200,
    }
}

/// ハイパーバイザを作り、ルートセルの CPU を全部起こす（スレッドから参照できるよう leak する）
pub fn boot_hypervisor(root: &CellDescBuilder, tunables: HvConfig) -> &'static TestHv {
    let system = system_desc(root, platform_desc());
    let hv = Hypervisor::new(
        MockPlatform::new(),
        &system,
        leak_pages(512),
        PhysAddr(POOL_PHYS_BASE),
        tunables,
    )
    .expect("root cell must build");
    let hv: &'static TestHv = Box::leak(Box::new(hv));
    for cpu in hv.cell_cpus(CellId::ROOT).iter() {
        hv.on_cpu_boot(cpu).expect("cpu boot");
    }
    hv
}

/// 1 つの CPU を模擬するスレッド。handle_events を回し続ける。
pub struct CpuRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CpuRunner {
    pub fn spawn(hv: &'static TestHv, cpu: CpuId) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                let _ = hv.on_wake(cpu);
                thread::yield_now();
            }
        });
        CpuRunner {
            stop,
            handle: Some(handle),
        }
    }

    pub fn spawn_all(hv: &'static TestHv, cpus: &[u32]) -> Vec<CpuRunner> {
        cpus.iter().map(|n| CpuRunner::spawn(hv, CpuId(*n))).collect()
    }
}

impl Drop for CpuRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("cpu runner panicked");
        }
    }
}

/// セル側ドライバの代わりに、通信ページの要求へ決まった返事をするスレッド
pub struct CommResponder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CommResponder {
    pub fn spawn(hv: &'static TestHv, cell: CellId, reply: u32) -> Self {
        let page = hv.with_cell(cell, |c| c.comm_page).flatten().expect("cell has a comm page");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                {
                    let mut pool = hv.pool.lock();
                    let region = comm::region_mut(&mut pool, page);
                    if region.msg_to_cell.read() != Message::None as u32
                        && region.reply() == comm::REPLY_NONE
                    {
                        region.reply_from_cell.write(reply);
                    }
                }
                thread::yield_now();
            }
        });
        CommResponder {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for CommResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("comm responder panicked");
        }
    }
}

/// 通信ページのセル状態を直接書き換える（セル側の振る舞いの模擬）
pub fn write_comm_state(hv: &TestHv, cell: CellId, state: comm::CommState) {
    let page = hv.with_cell(cell, |c| c.comm_page).flatten().expect("cell has a comm page");
    comm::region_mut(&mut hv.pool.lock(), page).set_state(state);
}
