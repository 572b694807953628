// src/mm/heap.rs
//
// ブロック単位（4KiB）のカーネルヒープ。
//
// - 管理表はブロック 1 つにつき 1 バイト。
//     bit0 (TAKEN)    : 使用中
//     bit6 (IS_FIRST) : 確保の先頭ブロック
//     bit7 (HAS_NEXT) : 同じ確保の続きが次のブロックにある
// - 確保は first-fit で連続ブロックを探す。
// - 解放は先頭ブロックから HAS_NEXT をたどって戻す。
//
// ストレージ本体と管理表は AsRef/AsMut<[u8]> なら何でもよい。
// ベアメタルでは固定アドレスの &'static mut [u8]、テストでは Vec<u8>。

use crate::logging;
use crate::mem::addr::{PhysAddr, PAGE_SIZE};

use super::{KernelHeap, PhysMemory};

pub const HEAP_BLOCK_SIZE: usize = PAGE_SIZE as usize;

const ENTRY_FREE: u8 = 0x00;
const ENTRY_TAKEN: u8 = 0x01;
const ENTRY_IS_FIRST: u8 = 0x40;
const ENTRY_HAS_NEXT: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// base がブロック境界に揃っていない
    MisalignedBase,
    /// ストレージ長がブロックサイズの倍数でない、または 4GiB を越える
    BadStorageSize,
    /// 管理表がブロック数より短い
    TableTooSmall,
}

pub struct BlockHeap<S, T> {
    base: PhysAddr,
    storage: S,
    table: T,
    blocks: usize,
}

impl<S, T> BlockHeap<S, T>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    pub fn new(base: PhysAddr, storage: S, mut table: T) -> Result<Self, HeapError> {
        if !base.is_aligned() {
            return Err(HeapError::MisalignedBase);
        }

        let len = storage.as_ref().len();
        if len % HEAP_BLOCK_SIZE != 0 || base.0 as u64 + len as u64 > 1u64 << 32 {
            return Err(HeapError::BadStorageSize);
        }

        let blocks = len / HEAP_BLOCK_SIZE;
        let entries = table.as_mut();
        if entries.len() < blocks {
            return Err(HeapError::TableTooSmall);
        }
        entries[..blocks].fill(ENTRY_FREE);

        Ok(BlockHeap {
            base,
            storage,
            table,
            blocks,
        })
    }

    pub fn free_blocks(&self) -> usize {
        self.entries()
            .iter()
            .filter(|&&e| e & ENTRY_TAKEN == 0)
            .count()
    }

    pub fn used_blocks(&self) -> usize {
        self.blocks - self.free_blocks()
    }

    fn entries(&self) -> &[u8] {
        &self.table.as_ref()[..self.blocks]
    }

    fn entries_mut(&mut self) -> &mut [u8] {
        let blocks = self.blocks;
        &mut self.table.as_mut()[..blocks]
    }

    /// 連続 count ブロックの空きを first-fit で探す。
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;

        for (i, &e) in self.entries().iter().enumerate() {
            if e & ENTRY_TAKEN != 0 {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }

    fn mark_taken(&mut self, start: usize, count: usize) {
        let entries = self.entries_mut();
        for i in start..start + count {
            let mut e = ENTRY_TAKEN;
            if i == start {
                e |= ENTRY_IS_FIRST;
            }
            if i + 1 < start + count {
                e |= ENTRY_HAS_NEXT;
            }
            entries[i] = e;
        }
    }

    fn block_of(&self, addr: PhysAddr) -> Option<usize> {
        let off = addr.0.checked_sub(self.base.0)? as usize;
        if off % HEAP_BLOCK_SIZE != 0 {
            return None;
        }
        let block = off / HEAP_BLOCK_SIZE;
        (block < self.blocks).then_some(block)
    }

    fn range(&self, addr: PhysAddr, len: usize) -> Option<core::ops::Range<usize>> {
        let start = addr.0.checked_sub(self.base.0)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.storage.as_ref().len()).then_some(start..end)
    }
}

impl<S, T> PhysMemory for BlockHeap<S, T>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    fn bytes(&self, addr: PhysAddr, len: usize) -> Option<&[u8]> {
        let r = self.range(addr, len)?;
        Some(&self.storage.as_ref()[r])
    }

    fn bytes_mut(&mut self, addr: PhysAddr, len: usize) -> Option<&mut [u8]> {
        let r = self.range(addr, len)?;
        Some(&mut self.storage.as_mut()[r])
    }

    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) -> Option<()> {
        let s = self.range(src, len)?;
        let d = self.range(dst, len)?;
        self.storage.as_mut().copy_within(s, d.start);
        Some(())
    }
}

impl<S, T> KernelHeap for BlockHeap<S, T>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    fn alloc(&mut self, size: usize) -> Option<PhysAddr> {
        // 0 バイトでも 1 ブロックは確保する
        let count = size.div_ceil(HEAP_BLOCK_SIZE).max(1);
        let start = self.find_run(count)?;
        self.mark_taken(start, count);
        Some(PhysAddr(self.base.0 + (start * HEAP_BLOCK_SIZE) as u32))
    }

    fn free(&mut self, addr: PhysAddr) {
        let Some(first) = self.block_of(addr) else {
            logging::warn("heap free: address outside heap");
            return;
        };

        if self.entries()[first] & ENTRY_IS_FIRST == 0 {
            logging::warn("heap free: not the start of an allocation");
            logging::info_hex(" addr", addr.0 as u64);
            return;
        }

        let entries = self.entries_mut();
        let mut i = first;
        loop {
            let e = entries[i];
            entries[i] = ENTRY_FREE;
            if e & ENTRY_HAS_NEXT == 0 {
                break;
            }
            i += 1;
        }
    }
}
