/*!
 * types
 *
 * 役割:
 *   - ハイパーバイザ全体で共有する素朴な ID 型・ビット集合・容量定数を集約する。
 *
 * やること:
 *   - CPU / セル / 割り込み線の ID newtype。
 *   - CPU 集合（64bit ビットマップ）と割り込み線集合（MAX_IRQS ビット）。
 *   - 固定容量テーブルのサイズ定数。
 *
 * やらないこと:
 *   - ページングや割り込みコントローラなどの arch 依存処理。
 *
 * 設計方針:
 *   - ヒープを使わない。全テーブルはここの定数で容量が決まる固定配列。
 */

use core::fmt;

/// 物理 CPU の最大数（CpuSet が u64 1 語に収まる範囲）
pub const MAX_CPUS: usize = 64;
/// ルートセルを含むセルの最大数
pub const MAX_CELLS: usize = 8;
/// 割り込み線の最大数（SGI/PPI/SPI 全体）
pub const MAX_IRQS: usize = 1024;
pub const IRQ_SET_WORDS: usize = MAX_IRQS / 32;

/// セル 1 つあたりのメモリ領域数の上限
pub const MAX_MEM_REGIONS: usize = 32;
/// セル 1 つあたりの割り込みコントローラ記述子数の上限
pub const MAX_IRQCHIPS: usize = 4;
/// セル 1 つあたりの PCI デバイス記述子数の上限
pub const MAX_PCI_DEVICES: usize = 16;
/// セル 1 つあたりの trap 登録数の上限
pub const MAX_TRAP_REGIONS: usize = 48;
/// CPU ごとの pending 割り込みキュー容量
pub const MAX_PENDING_IRQS: usize = 16;
/// ページテーブル用ページプールの最大ページ数
pub const MAX_POOL_PAGES: usize = 16384;

/// 物理 CPU 番号
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// セル ID（0 は常にルートセル）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub u32);

impl CellId {
    pub const ROOT: CellId = CellId(0);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

/// 割り込み線番号
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqId(pub u32);

impl IrqId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_IRQS
    }
}

// ─────────────────────────────────────────────
// CpuSet
// ─────────────────────────────────────────────

/// 物理 CPU の集合（bit n = CPU n）
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: CpuSet = CpuSet(0);

    pub const fn from_bits(bits: u64) -> Self {
        CpuSet(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn single(cpu: CpuId) -> Self {
        let mut set = CpuSet::EMPTY;
        set.insert(cpu);
        set
    }

    pub fn contains(self, cpu: CpuId) -> bool {
        cpu.index() < MAX_CPUS && (self.0 >> cpu.index()) & 1 != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 |= 1 << cpu.index();
        }
    }

    pub fn remove(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 &= !(1 << cpu.index());
        }
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_subset_of(self, other: CpuSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(self, other: CpuSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 | other.0)
    }

    pub fn difference(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & !other.0)
    }

    /// 最小番号の CPU
    pub fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuId(self.0.trailing_zeros()))
        }
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let bits = self.0;
        (0..MAX_CPUS as u32)
            .filter(move |n| (bits >> n) & 1 != 0)
            .map(CpuId)
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({:#x})", self.0)
    }
}

// ─────────────────────────────────────────────
// IrqSet
// ─────────────────────────────────────────────

/// 割り込み線の集合（セルの routing bitmap）
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IrqSet {
    words: [u32; IRQ_SET_WORDS],
}

impl Default for IrqSet {
    fn default() -> Self {
        IrqSet::EMPTY
    }
}

impl IrqSet {
    pub const EMPTY: IrqSet = IrqSet {
        words: [0; IRQ_SET_WORDS],
    };

    pub fn contains(&self, irq: IrqId) -> bool {
        irq.is_valid() && (self.words[irq.index() / 32] >> (irq.index() % 32)) & 1 != 0
    }

    pub fn insert(&mut self, irq: IrqId) {
        if irq.is_valid() {
            self.words[irq.index() / 32] |= 1 << (irq.index() % 32);
        }
    }

    pub fn remove(&mut self, irq: IrqId) {
        if irq.is_valid() {
            self.words[irq.index() / 32] &= !(1 << (irq.index() % 32));
        }
    }

    /// 32 本単位の語を OR で取り込む（irqchip 記述子の pin_bitmap 用）
    pub fn insert_word(&mut self, first_irq: u32, word: u32) {
        for bit in 0..32 {
            if (word >> bit) & 1 != 0 {
                self.insert(IrqId(first_irq + bit));
            }
        }
    }

    /// irq を先頭とする 32 本分のビットを取り出す（レジスタ幅のマスク作成用）
    pub fn word_at(&self, first_irq: u32) -> u32 {
        let mut word = 0u32;
        for bit in 0..32 {
            if self.contains(IrqId(first_irq + bit)) {
                word |= 1 << bit;
            }
        }
        word
    }

    pub fn intersects(&self, other: &IrqSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn union_with(&mut self, other: &IrqSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
    }

    pub fn subtract(&mut self, other: &IrqSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    pub fn is_subset_of(&self, other: &IrqSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = IrqId> + '_ {
        (0..MAX_IRQS as u32)
            .map(IrqId)
            .filter(move |irq| self.contains(*irq))
    }
}

impl fmt::Debug for IrqSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|irq| irq.0)).finish()
    }
}
