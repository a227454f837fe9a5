// src/mmio/hypercall.rs
//
// 管理インタフェース（ハイパーコール）の番号と振り分け。
// - 戻り値は成功なら 0 以上、失敗なら負の errno（HvError::errno）。
// - 引数はレジスタ 2 本。ポインタはゲスト物理アドレスとして受け取り、
//   呼び出し元セルの second-stage で引いてから読む。

use spin::Mutex;

use crate::arch::Platform;
use crate::config::layout::CellDescHeader;
use crate::config::{CellConfig, MAX_CONFIG_SIZE};
use crate::control::Hypervisor;
use crate::error::HvError;
use crate::logging;
use crate::mem::addr::{GuestAddr, PAGE_SIZE};
use crate::mm::address_space::AccessKind;
use crate::types::{CellId, CpuId};

pub const HC_DISABLE: u64 = 0;
pub const HC_CELL_CREATE: u64 = 1;
pub const HC_CELL_START: u64 = 2;
pub const HC_CELL_SET_LOADABLE: u64 = 3;
pub const HC_CELL_DESTROY: u64 = 4;
pub const HC_HYPERVISOR_GET_INFO: u64 = 5;
pub const HC_CELL_GET_STATE: u64 = 6;
pub const HC_CPU_GET_INFO: u64 = 7;
pub const HC_DEBUG_CONSOLE_PUTC: u64 = 8;

/// 記述子のコピー先。cell_create は直列なので 1 つで足りる
static DESCRIPTOR_BUFFER: Mutex<[u8; MAX_CONFIG_SIZE]> = Mutex::new([0; MAX_CONFIG_SIZE]);

fn cell_arg(arg: u64) -> CellId {
    CellId(u32::try_from(arg).unwrap_or(u32::MAX))
}

fn cpu_arg(arg: u64) -> CpuId {
    CpuId(u32::try_from(arg).unwrap_or(u32::MAX))
}

impl<P: Platform> Hypervisor<P> {
    pub fn hypercall(&self, cpu: CpuId, code: u64, arg1: u64, arg2: u64) -> i64 {
        let result = match code {
            HC_DISABLE => self.disable(cpu).map(|()| 0),
            HC_CELL_CREATE => self.create_from_guest(cpu, arg1).map(|id| id.0 as i64),
            HC_CELL_START => self.cell_start(cpu, cell_arg(arg1)).map(|()| 0),
            HC_CELL_SET_LOADABLE => self.cell_set_loadable(cpu, cell_arg(arg1)).map(|()| 0),
            HC_CELL_DESTROY => self.cell_destroy(cpu, cell_arg(arg1)).map(|()| 0),
            HC_HYPERVISOR_GET_INFO => self.hypervisor_get_info(arg1),
            HC_CELL_GET_STATE => self.cell_get_state(cpu, cell_arg(arg1)),
            HC_CPU_GET_INFO => self.cpu_get_info(cpu, cpu_arg(arg1), arg2),
            HC_DEBUG_CONSOLE_PUTC => self.debug_putc(cpu, arg1).map(|()| 0),
            _ => {
                logging::warn_hex("hypercall: unknown code", code);
                Err(HvError::NotSupported)
            }
        };
        result.unwrap_or_else(HvError::errno)
    }

    /// 呼び出し元セルのゲスト物理アドレスから読む（ページごとに second-stage で引く）
    fn copy_from_cell(&self, cpu: CpuId, guest: u64, buf: &mut [u8]) -> Result<(), HvError> {
        let cell = self.percpu(cpu).ok_or(HvError::InvalidArgument)?.cell();
        let slot = self.cells[cell.index()].read();
        let c = slot.as_ref().ok_or(HvError::NotFound)?;
        let pool = self.pool.lock();

        let mut done = 0;
        while done < buf.len() {
            let addr = guest.checked_add(done as u64).ok_or(HvError::InvalidArgument)?;
            let in_page = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
            let chunk = in_page.min(buf.len() - done);
            let phys = c
                .memory
                .translate(&pool, GuestAddr(addr), AccessKind::Read)
                .ok_or(HvError::InvalidArgument)?;
            if !self.platform.read_phys(phys, &mut buf[done..done + chunk]) {
                return Err(HvError::InvalidArgument);
            }
            done += chunk;
        }
        Ok(())
    }

    fn create_from_guest(&self, cpu: CpuId, guest: u64) -> Result<CellId, HvError> {
        let mut buffer = DESCRIPTOR_BUFFER.try_lock().ok_or(HvError::Busy)?;
        let header_len = core::mem::size_of::<CellDescHeader>();
        self.copy_from_cell(cpu, guest, &mut buffer[..header_len])?;
        let total = CellConfig::peek_size(&buffer[..header_len])?;
        self.copy_from_cell(cpu, guest, &mut buffer[..total])?;
        self.cell_create(cpu, &buffer[..total])
    }

    fn debug_putc(&self, cpu: CpuId, c: u64) -> Result<(), HvError> {
        let cell = self.percpu(cpu).ok_or(HvError::InvalidArgument)?.cell();
        if self.with_cell(cell, |c| c.may_putc()) != Some(true) {
            return Err(HvError::PermissionDenied);
        }
        logging::putc(c as u8);
        Ok(())
    }
}
