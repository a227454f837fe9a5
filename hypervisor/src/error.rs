// src/error.rs
//
// 管理操作の失敗を 1 つの型にまとめ、ハイパーコールの戻り値（負の errno）へ写す。
// - 各層のエラー（PagingError / ConfigError / IrqError / TrapError / ControlError）は
//   そのまま包む。呼び出し側で原因を match できるようにするため。
// - errno への写像はこのファイルだけが知っている。

use crate::config::ConfigError;
use crate::mm::paging::PagingError;

/// 割り込みエンジンの失敗
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqError {
    /// 宛先 CPU の保留キューが満杯（呼び出し側は物理ペンディングへフォールバックする）
    QueueFull,
    /// 送り手のセルがその割り込み線を所有していない
    NotOwned,
    InvalidIrq,
}

/// トラップ表の失敗
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapError {
    TableFull,
    EmptyRange,
    /// 同じ範囲がすでに登録されている
    Duplicate,
    NotRegistered,
}

/// CPU 制御状態機械の失敗
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// 今の状態からはその遷移を要求できない
    InvalidState,
    /// 有限回の待機内に Suspended へ到達しなかった（CPU は Failed に落とした）
    Unresponsive,
    InvalidCpu,
    /// 以前に Failed へ落ちた CPU
    CpuFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvError {
    Paging(PagingError),
    Config(ConfigError),
    Irq(IrqError),
    Trap(TrapError),
    Control(ControlError),
    /// 別の管理操作が進行中
    Busy,
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidArgument,
    NoMemory,
    TooBig,
    NotSupported,
}

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const EIO: i64 = 5;
pub const E2BIG: i64 = 7;
pub const ENOMEM: i64 = 12;
pub const EBUSY: i64 = 16;
pub const EEXIST: i64 = 17;
pub const EINVAL: i64 = 22;
pub const ENOSYS: i64 = 38;

impl HvError {
    /// ハイパーコールの戻り値（負の errno）
    pub fn errno(self) -> i64 {
        let code = match self {
            HvError::Paging(PagingError::OutOfPageTableCapacity) => ENOMEM,
            HvError::Paging(_) => EINVAL,
            HvError::Config(ConfigError::TooBig) => E2BIG,
            HvError::Config(_) => EINVAL,
            HvError::Irq(IrqError::QueueFull) => EBUSY,
            HvError::Irq(_) => EINVAL,
            HvError::Trap(TrapError::TableFull) => ENOMEM,
            HvError::Trap(_) => EINVAL,
            HvError::Control(ControlError::Unresponsive) => EIO,
            HvError::Control(ControlError::CpuFailed) => EIO,
            HvError::Control(_) => EINVAL,
            HvError::Busy => EBUSY,
            HvError::NotFound => ENOENT,
            HvError::PermissionDenied => EPERM,
            HvError::AlreadyExists => EEXIST,
            HvError::InvalidArgument => EINVAL,
            HvError::NoMemory => ENOMEM,
            HvError::TooBig => E2BIG,
            HvError::NotSupported => ENOSYS,
        };
        -code
    }
}

impl From<PagingError> for HvError {
    fn from(e: PagingError) -> Self {
        HvError::Paging(e)
    }
}

impl From<ConfigError> for HvError {
    fn from(e: ConfigError) -> Self {
        HvError::Config(e)
    }
}

impl From<IrqError> for HvError {
    fn from(e: IrqError) -> Self {
        HvError::Irq(e)
    }
}

impl From<TrapError> for HvError {
    fn from(e: TrapError) -> Self {
        HvError::Trap(e)
    }
}

impl From<ControlError> for HvError {
    fn from(e: ControlError) -> Self {
        HvError::Control(e)
    }
}
