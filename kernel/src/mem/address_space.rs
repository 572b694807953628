// kernel/src/mem/address_space.rs
//
// 役割:
// - プロセス 1 つ分の 32bit 仮想アドレス空間（ページディレクトリ + 1024 枚のテーブル）。
// - 「どの仮想ページがどの物理ページにどの権限でマップされているか」は
//   ページテーブルそのものが唯一の記録。別の管理表は持たない。
//
// 不変条件:
// - ディレクトリの各エントリは、この空間だけが所有するテーブルを指す。
// - エントリの上位 20bit はページ境界のアドレス、下位 12bit はフラグだけ。
// - create() は全部作れたときだけ成功する。途中で失敗したら作った分を全部返す。
// - destroy() は self を消費するので二重解放は型で起きない。
//
// やらないこと:
// - demand paging / copy-on-write
// - テーブルの遅延確保（最初から 4GiB 全域を埋める）

use crate::arch::PrivilegeRuntime;
use crate::kernel::trace;
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::paging::{
    directory_index, table_index, PageEntry, PageFlags, ENTRIES_PER_TABLE, ENTRY_SIZE,
    TABLE_BYTES, TABLE_SPAN,
};
use crate::mm::{KernelHeap, PhysMemory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    InvalidArgument,
    OutOfMemory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PhysAddr,
}

impl AddressSpace {
    /// 4GiB 全域を恒等マップした空間を作る。全ページに template を付ける。
    pub fn create<H: KernelHeap + ?Sized>(
        heap: &mut H,
        template: PageFlags,
    ) -> Result<AddressSpace, AddressSpaceError> {
        let directory = heap
            .alloc_zeroed(TABLE_BYTES)
            .ok_or(AddressSpaceError::OutOfMemory)?;
        let space = AddressSpace { directory };

        for dir_index in 0..ENTRIES_PER_TABLE {
            if let Err(e) = space.populate_table(heap, dir_index, template) {
                space.release(heap);
                return Err(e);
            }
        }

        trace::trace_address_space_created(directory);
        Ok(space)
    }

    fn populate_table<H: KernelHeap + ?Sized>(
        &self,
        heap: &mut H,
        dir_index: usize,
        template: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        let table = heap
            .alloc(TABLE_BYTES)
            .ok_or(AddressSpaceError::OutOfMemory)?;

        let base = dir_index as u32 * TABLE_SPAN;
        let Some(bytes) = heap.bytes_mut(table, TABLE_BYTES) else {
            heap.free(table);
            return Err(AddressSpaceError::OutOfMemory);
        };
        for (i, slot) in bytes.chunks_exact_mut(ENTRY_SIZE as usize).enumerate() {
            let entry = PageEntry::from_bits((base + i as u32 * PAGE_SIZE) | template.bits());
            slot.copy_from_slice(&entry.bits().to_le_bytes());
        }

        let dir_entry = PageEntry::from_bits(table.0 | (template | PageFlags::WRITABLE).bits());
        let slot = self.directory_slot(dir_index);
        if heap.write_u32(slot, dir_entry.bits()).is_none() {
            heap.free(table);
            return Err(AddressSpaceError::OutOfMemory);
        }
        Ok(())
    }

    /// テーブルを全部返してからディレクトリを返す。
    pub fn destroy<H: KernelHeap + ?Sized>(self, heap: &mut H) {
        trace::trace_address_space_destroyed(self.directory);
        self.release(heap);
    }

    fn release<H: KernelHeap + ?Sized>(&self, heap: &mut H) {
        for dir_index in 0..ENTRIES_PER_TABLE {
            let Some(bits) = heap.read_u32(self.directory_slot(dir_index)) else {
                continue;
            };
            let entry = PageEntry::from_bits(bits);
            if entry.is_present() {
                heap.free(entry.address());
            }
        }
        heap.free(self.directory);
    }

    pub fn directory(&self) -> PhysAddr {
        self.directory
    }

    /// CPU にこの空間を読み込ませる。
    pub fn switch_in<R: PrivilegeRuntime + ?Sized>(&self, runtime: &mut R) {
        runtime.load_page_directory(self.directory);
    }

    /// 1 ページをマップする。virt / phys のどちらかが境界に揃っていなければ何も書かない。
    pub fn map<M: PhysMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        if !virt.is_aligned() {
            return Err(AddressSpaceError::InvalidArgument);
        }
        let entry = PageEntry::new(phys, flags).ok_or(AddressSpaceError::InvalidArgument)?;
        let slot = self
            .entry_slot(mem, virt)
            .ok_or(AddressSpaceError::InvalidArgument)?;
        mem.write_u32(slot, entry.bits())
            .ok_or(AddressSpaceError::InvalidArgument)?;

        trace::trace_map(virt, phys, flags);
        Ok(())
    }

    /// page_count ページを連続でマップする。
    /// 検証（境界・4GiB 越え）は書き込み前にすべて済ませる。
    pub fn map_range<M: PhysMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        virt: VirtAddr,
        phys: PhysAddr,
        page_count: usize,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        if !virt.is_aligned() || !phys.is_aligned() {
            return Err(AddressSpaceError::InvalidArgument);
        }

        let span = page_count as u64 * PAGE_SIZE as u64;
        let limit = 1u64 << 32;
        if virt.0 as u64 + span > limit || phys.0 as u64 + span > limit {
            return Err(AddressSpaceError::InvalidArgument);
        }

        for i in 0..page_count {
            let delta = i as u32 * PAGE_SIZE;
            self.map(mem, VirtAddr(virt.0 + delta), PhysAddr(phys.0 + delta), flags)?;
        }
        Ok(())
    }

    /// 物理範囲 [phys_start, phys_end) を virt から始まる範囲にマップする。
    pub fn map_region<M: PhysMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        virt: VirtAddr,
        phys_start: PhysAddr,
        phys_end: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        if phys_end < phys_start || !phys_start.is_aligned() || !phys_end.is_aligned() {
            return Err(AddressSpaceError::InvalidArgument);
        }

        let bytes = phys_end.0 - phys_start.0;
        let page_count = bytes.div_ceil(PAGE_SIZE) as usize;
        self.map_range(mem, virt, phys_start, page_count, flags)
    }

    /// 仮想アドレスを物理アドレスに引く。PRESENT でなければ None。
    pub fn translate<M: PhysMemory + ?Sized>(&self, mem: &M, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.entry(mem, virt)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr(entry.address().0 | virt.page_offset()))
    }

    /// テーブルエントリをそのまま返す（診断・テスト用）
    pub fn entry<M: PhysMemory + ?Sized>(&self, mem: &M, virt: VirtAddr) -> Option<PageEntry> {
        let slot = self.entry_slot(mem, virt)?;
        mem.read_u32(slot).map(PageEntry::from_bits)
    }

    /// ユーザ仮想範囲 → カーネルバッファ（ページ単位で引き直す）
    pub fn read_bytes<M: PhysMemory + ?Sized>(
        &self,
        mem: &M,
        virt: VirtAddr,
        out: &mut [u8],
    ) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < out.len() {
            let v = virt
                .offset(done as u32)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            let chunk = (PAGE_SIZE - v.page_offset()) as usize;
            let chunk = chunk.min(out.len() - done);

            let phys = self
                .translate(mem, v)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            let src = mem
                .bytes(phys, chunk)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            out[done..done + chunk].copy_from_slice(src);
            done += chunk;
        }
        Ok(())
    }

    /// カーネルバッファ → ユーザ仮想範囲
    pub fn write_bytes<M: PhysMemory + ?Sized>(
        &self,
        mem: &mut M,
        virt: VirtAddr,
        data: &[u8],
    ) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < data.len() {
            let v = virt
                .offset(done as u32)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            let chunk = (PAGE_SIZE - v.page_offset()) as usize;
            let chunk = chunk.min(data.len() - done);

            let phys = self
                .translate(mem, v)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            let dst = mem
                .bytes_mut(phys, chunk)
                .ok_or(AddressSpaceError::InvalidArgument)?;
            dst.copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    fn directory_slot(&self, dir_index: usize) -> PhysAddr {
        PhysAddr(self.directory.0 + dir_index as u32 * ENTRY_SIZE)
    }

    fn entry_slot<M: PhysMemory + ?Sized>(&self, mem: &M, virt: VirtAddr) -> Option<PhysAddr> {
        let dir_entry = PageEntry::from_bits(mem.read_u32(self.directory_slot(directory_index(virt)))?);
        if !dir_entry.is_present() {
            return None;
        }
        dir_entry
            .address()
            .offset(table_index(virt) as u32 * ENTRY_SIZE)
    }
}
