// src/control/comm.rs
//
// セルとハイパーバイザの通信ページ。
// - ページはページプールから確保する（物理アドレスが固定で、破棄時にスクラブされる）。
// - レイアウトはセル側のドライバと共有する ABI。先頭 64 バイトだけを使う。
// - 各フィールドはセル側 CPU と同時に読み書きされるので Volatile で触る。
//
// メッセージ:
// - ハイパーバイザ → セル: msg_to_cell に書き、reply_from_cell を有限回ポーリングする。
// - セルが SHUT_DOWN / FAILED なら返事を待たずに了承扱い。
// - PASSIVE_COMMREG のセルは返事をしない前提なので常に了承扱い。

use volatile::Volatile;

use crate::config::layout::ConsoleDesc;
use crate::mm::{Page, PageIndex, PagePool};

pub const COMM_SIGNATURE: [u8; 6] = *b"JHCOMM";
pub const COMM_REVISION: u16 = 2;

/// flags: セルがデバッグコンソールへ書いてよい
pub const COMM_FLAG_DBG_PUTC_PERMITTED: u32 = 0x0001;
/// flags: デバッグコンソールが有効
pub const COMM_FLAG_DBG_PUTC_ACTIVE: u32 = 0x0002;

/// cell_state の値
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommState {
    Running = 0,
    /// 再構成を拒否している
    RunningLocked = 1,
    ShutDown = 2,
    Failed = 3,
    /// 通信ページのリビジョン不一致でセル側が止まった
    FailedCommRev = 4,
}

impl CommState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CommState::Running),
            1 => Some(CommState::RunningLocked),
            2 => Some(CommState::ShutDown),
            3 => Some(CommState::Failed),
            4 => Some(CommState::FailedCommRev),
            _ => None,
        }
    }
}

/// ハイパーバイザ → セル
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    None = 0,
    ShutdownRequest = 1,
    ReconfigCompleted = 2,
}

impl Message {
    /// 了承が必要な要求か（false なら通知のみ）
    pub fn is_request(self) -> bool {
        matches!(self, Message::ShutdownRequest)
    }
}

/// セル → ハイパーバイザ
pub const REPLY_NONE: u32 = 0;
pub const REPLY_UNKNOWN: u32 = 1;
pub const REPLY_DENIED: u32 = 2;
pub const REPLY_APPROVED: u32 = 3;
pub const REPLY_RECEIVED: u32 = 4;

#[repr(C)]
pub struct CommRegion {
    pub signature: Volatile<[u8; 6]>,
    pub revision: Volatile<u16>,
    pub cell_state: Volatile<u32>,
    pub msg_to_cell: Volatile<u32>,
    pub reply_from_cell: Volatile<u32>,
    pub flags: Volatile<u32>,
    pub console: Volatile<ConsoleDesc>,
    pub pci_mmconfig_base: Volatile<u64>,
}

const _: () = assert!(core::mem::size_of::<CommRegion>() == 64);
const _: () = assert!(core::mem::size_of::<CommRegion>() <= core::mem::size_of::<Page>());

/// プール上の通信ページを CommRegion として見る
pub fn region_mut(pool: &mut PagePool, page: PageIndex) -> &mut CommRegion {
    let page: &mut Page = pool.page_mut(page);
    // Safety:
    // - Page は 4KiB 境界・4KiB 長で、CommRegion（64 バイト, align 8）を先頭に収められる。
    // - CommRegion の各フィールドはどのビットパターンでも有効な値（整数 / 配列 / packed 構造体）。
    // - 返す参照の寿命は pool の可変借用に縛られる。
    unsafe { &mut *(page as *mut Page as *mut CommRegion) }
}

impl CommRegion {
    pub fn init(&mut self, state: CommState, flags: u32, pci_mmconfig_base: u64) {
        self.signature.write(COMM_SIGNATURE);
        self.revision.write(COMM_REVISION);
        self.cell_state.write(state as u32);
        self.msg_to_cell.write(Message::None as u32);
        self.reply_from_cell.write(REPLY_NONE);
        self.flags.write(flags);
        self.pci_mmconfig_base.write(pci_mmconfig_base);
    }

    pub fn state(&self) -> Option<CommState> {
        CommState::from_raw(self.cell_state.read())
    }

    pub fn set_state(&mut self, state: CommState) {
        self.cell_state.write(state as u32);
    }

    /// セル側が見出しを壊していないか
    pub fn header_intact(&self) -> bool {
        self.signature.read() == COMM_SIGNATURE && self.revision.read() == COMM_REVISION
    }

    /// 返事を消してからメッセージを書く（セルは msg を見て reply を書く）
    pub fn post(&mut self, msg: Message) {
        self.reply_from_cell.write(REPLY_NONE);
        self.msg_to_cell.write(msg as u32);
    }

    pub fn reply(&self) -> u32 {
        self.reply_from_cell.read()
    }
}

/// ポーリング 1 回分の判定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied,
    Waiting,
}

pub fn judge(state: Option<CommState>, reply: u32, msg: Message) -> Verdict {
    if matches!(state, Some(CommState::ShutDown) | Some(CommState::Failed)) {
        return Verdict::Approved;
    }
    match reply {
        REPLY_NONE => Verdict::Waiting,
        REPLY_APPROVED if msg.is_request() => Verdict::Approved,
        REPLY_RECEIVED if !msg.is_request() => Verdict::Approved,
        _ => Verdict::Denied,
    }
}

#[cfg(test)]
#[path = "comm_test.rs"]
mod comm_test;
