// src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレスに型を付ける（32bit）。
// - ページ境界（4KiB）への切り上げ・切り捨てをここに集約する。
// やらないこと:
// - ページテーブルの読み書き（それは mem::address_space の責務）

use core::fmt;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u32 = 4096;

const PAGE_MASK: u32 = PAGE_SIZE - 1;

impl PhysAddr {
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & !PAGE_MASK)
    }

    /// 次のページ境界へ切り上げる。4GiB を越える場合は None。
    pub fn align_up(self) -> Option<PhysAddr> {
        self.0.checked_add(PAGE_MASK).map(|v| PhysAddr(v & !PAGE_MASK))
    }

    pub fn offset(self, bytes: u32) -> Option<PhysAddr> {
        self.0.checked_add(bytes).map(PhysAddr)
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }
}

impl VirtAddr {
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !PAGE_MASK)
    }

    pub fn align_up(self) -> Option<VirtAddr> {
        self.0.checked_add(PAGE_MASK).map(|v| VirtAddr(v & !PAGE_MASK))
    }

    pub fn offset(self, bytes: u32) -> Option<VirtAddr> {
        self.0.checked_add(bytes).map(VirtAddr)
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & PAGE_MASK
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}
