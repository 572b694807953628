// kernel/src/mem/paging.rs
//
// 32bit 2 段ページングのエントリ表現。
// - 1 エントリ = u32。上位 20bit がページ境界のアドレス、下位 12bit がフラグ。
// - ディレクトリ 1024 エントリ × テーブル 1024 エントリ × 4KiB = 4GiB。

use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ring3 からアクセス可能
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED = 1 << 5;
    }
}

/// 1 テーブル（ディレクトリも同じ）あたりのエントリ数
pub const ENTRIES_PER_TABLE: usize = 1024;

/// 1 エントリのバイト数
pub const ENTRY_SIZE: u32 = 4;

/// テーブル 1 枚のバイト数（= 1 ページ）
pub const TABLE_BYTES: usize = ENTRIES_PER_TABLE * ENTRY_SIZE as usize;

/// ディレクトリ 1 エントリがカバーする仮想アドレス範囲（4MiB）
pub const TABLE_SPAN: u32 = ENTRIES_PER_TABLE as u32 * PAGE_SIZE;

const ADDRESS_MASK: u32 = 0xFFFF_F000;
const FLAGS_MASK: u32 = 0x0000_0FFF;

pub fn directory_index(virt: VirtAddr) -> usize {
    (virt.0 / TABLE_SPAN) as usize
}

pub fn table_index(virt: VirtAddr) -> usize {
    (virt.0 % TABLE_SPAN / PAGE_SIZE) as usize
}

/// ページディレクトリ / ページテーブルの 1 エントリ。
///
/// ビット詰めの直接操作はこの型の中だけで行う。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u32);

impl PageEntry {
    pub const EMPTY: PageEntry = PageEntry(0);

    /// アドレスがページ境界に揃っていなければ None。
    pub fn new(addr: PhysAddr, flags: PageFlags) -> Option<PageEntry> {
        if !addr.is_aligned() {
            return None;
        }
        Some(PageEntry(addr.0 | flags.bits()))
    }

    pub const fn from_bits(bits: u32) -> PageEntry {
        PageEntry(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn address(self) -> PhysAddr {
        PhysAddr(self.0 & ADDRESS_MASK)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageEntry({:#x}, {:?})", self.address().0, self.flags())
    }
}
