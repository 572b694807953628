// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - PhysMemory: 物理アドレス範囲をバイト列として読み書きする窓。
// - KernelHeap: ページテーブル・スタック・イメージ等を確保するカーネルヒープ。
//
// ページテーブルもユーザのバッファも、すべてこの 2 つの trait 経由で触る。
// ベアメタルでは恒等マップされた物理メモリそのもの、
// ホスト上のテストでは Vec がその実体になる。

pub mod heap;

use crate::mem::addr::PhysAddr;

pub use heap::{BlockHeap, HeapError, HEAP_BLOCK_SIZE};

/// 物理メモリの窓
pub trait PhysMemory {
    /// [addr, addr+len) を読む。範囲外なら None。
    fn bytes(&self, addr: PhysAddr, len: usize) -> Option<&[u8]>;

    /// [addr, addr+len) を書く。範囲外なら None。
    fn bytes_mut(&mut self, addr: PhysAddr, len: usize) -> Option<&mut [u8]>;

    /// 重なりを許すコピー（memmove 相当）
    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) -> Option<()>;

    fn read_u32(&self, addr: PhysAddr) -> Option<u32> {
        let b = self.bytes(addr, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u32(&mut self, addr: PhysAddr, value: u32) -> Option<()> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Some(())
    }
}

/// カーネルヒープ
pub trait KernelHeap: PhysMemory {
    /// size バイト以上の領域を確保する。先頭は必ずページ境界。
    fn alloc(&mut self, size: usize) -> Option<PhysAddr>;

    /// 解放する。確保の先頭以外を渡された場合は何もしない。
    fn free(&mut self, addr: PhysAddr);

    /// 0 埋めして確保する。
    fn alloc_zeroed(&mut self, size: usize) -> Option<PhysAddr> {
        let addr = self.alloc(size)?;
        match self.bytes_mut(addr, size) {
            Some(buf) => {
                buf.fill(0);
                Some(addr)
            }
            None => {
                self.free(addr);
                None
            }
        }
    }
}
