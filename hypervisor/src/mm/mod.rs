// src/mm/mod.rs
//
// ページテーブル用ページプールの入り口。
// - 起動時に渡された静的なページ配列を、使用中ビットマップで管理する最小アロケータ。
// - 確保時にゼロ埋め、解放時にスクラブ（前の持ち主の内容を残さない）。
// - 状態は構造体 + カウンタに閉じ込め、外部 API はすべて safe にする。
//
// サブモジュール:
// - paging:        4 段の second-stage ページテーブル操作
// - address_space: セル単位の論理領域リスト + コミット/リボーク

pub mod address_space;
pub mod paging;

use crate::logging;
use crate::mem::addr::{PhysAddr, PAGE_SIZE};
use crate::types::MAX_POOL_PAGES;

const POOL_BITMAP_WORDS: usize = MAX_POOL_PAGES / 64;

/// 4KiB 境界に揃ったページ 1 枚
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page(pub [u64; 512]);

impl Page {
    pub const ZERO: Page = Page([0; 512]);
}

/// プール内ページの番号
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageIndex(pub usize);

/// ページテーブル用ページプール。
///
/// # 設計上の前提
/// - プールはハイパーバイザ全体で 1 インスタンスのみ（`spin::Mutex` の内側に置く）。
/// - `pages[i]` の物理アドレスは `phys_base + i * PAGE_SIZE`。
pub struct PagePool {
    pages: &'static mut [Page],
    phys_base: u64,
    used: [u64; POOL_BITMAP_WORDS],
    used_pages: usize,
}

impl PagePool {
    pub fn new(pages: &'static mut [Page], phys_base: PhysAddr) -> Self {
        let limit = pages.len().min(MAX_POOL_PAGES);
        let pages = &mut pages[..limit];
        PagePool {
            pages,
            phys_base: phys_base.0,
            used: [0; POOL_BITMAP_WORDS],
            used_pages: 0,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub fn free_pages(&self) -> usize {
        self.total_pages() - self.used_pages
    }

    fn is_used(&self, idx: usize) -> bool {
        (self.used[idx / 64] >> (idx % 64)) & 1 != 0
    }

    /// 空きページを 1 枚確保してゼロ埋めして返す。
    /// - 空きなし: None
    pub fn alloc(&mut self) -> Option<PageIndex> {
        let total = self.total_pages();
        for (w, word) in self.used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let idx = w * 64 + bit;
            if idx >= total {
                return None;
            }
            *word |= 1 << bit;
            self.used_pages += 1;
            self.pages[idx] = Page::ZERO;
            return Some(PageIndex(idx));
        }
        None
    }

    /// ページを返却する。二重解放はログだけ出して無視する。
    pub fn free(&mut self, page: PageIndex) {
        let idx = page.0;
        if idx >= self.total_pages() || !self.is_used(idx) {
            logging::error("INVARIANT VIOLATION: page pool double free");
            return;
        }
        self.pages[idx] = Page::ZERO;
        self.used[idx / 64] &= !(1 << (idx % 64));
        self.used_pages -= 1;
    }

    pub fn phys_of(&self, page: PageIndex) -> PhysAddr {
        PhysAddr(self.phys_base + page.0 as u64 * PAGE_SIZE)
    }

    /// 物理アドレスからプール内ページを逆引きする（プール外なら None）
    pub fn index_of(&self, phys: PhysAddr) -> Option<PageIndex> {
        let offset = phys.0.checked_sub(self.phys_base)?;
        let idx = (offset / PAGE_SIZE) as usize;
        if idx < self.total_pages() && self.is_used(idx) {
            Some(PageIndex(idx))
        } else {
            None
        }
    }

    pub fn page(&self, page: PageIndex) -> &Page {
        &self.pages[page.0]
    }

    pub fn page_mut(&mut self, page: PageIndex) -> &mut Page {
        &mut self.pages[page.0]
    }

    pub fn dump_stats(&self, when: &str) {
        logging::info(when);
        logging::info_u64(" page pool used", self.used_pages as u64);
        logging::info_u64(" page pool total", self.total_pages() as u64);
    }
}
