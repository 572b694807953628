// kernel/src/loader/elf.rs
//
// ELF パーサとの境界と、goblin を使った実装。
//
// - parse() はカーネルヒープ上のファイル内容を読み、全 PT_LOAD セグメントを
//   1 つのバッファへ p_vaddr - (最小 p_vaddr のページ先頭) の位置にコピーする。
//   bss 部分（p_filesz..p_memsz）はバッファごと 0 埋め済み。
// - 仮想ページと物理ページが 1 対 1 になるので、同じページに載る 2 つのセグメントも
//   同じ物理ページを指す。ローダはセグメントをページ単位でそのままマップできる。
// - 受け付けるのは ELF32 / little endian / i386 だけ。

use alloc::vec::Vec;

use goblin::elf::header::{ELFMAG, EM_386, SELFMAG};
use goblin::elf::program_header::{PF_W, PT_LOAD};
use goblin::elf::Elf;

use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mm::KernelHeap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfError {
    /// ELF マジックがない（他のローダに回してよい）
    NotThisFormat,
    /// ELF だが壊れている
    Malformed,
    /// ELF だがこのカーネルでは動かせない（64bit、別アーキなど）
    Unsupported,
    OutOfMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: VirtAddr,
    pub load_segments: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub vaddr: u32,
    pub offset: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
}

impl ProgramHeader {
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}

pub trait ElfParser {
    type Handle;

    /// [image, image+len) に読み込まれたファイルを解析する。
    fn parse<H: KernelHeap + ?Sized>(
        &mut self,
        heap: &mut H,
        image: PhysAddr,
        len: usize,
    ) -> Result<Self::Handle, ElfError>;

    fn header(&self, handle: &Self::Handle) -> ElfHeader;

    /// ロード対象のプログラムヘッダ（PT_LOAD のみ、ファイル中の順）
    fn program_headers<'h>(&self, handle: &'h Self::Handle) -> &'h [ProgramHeader];

    /// index 番目のセグメントの内容が置かれた物理アドレス
    fn segment_physical_address(&self, handle: &Self::Handle, index: usize) -> Option<PhysAddr>;

    fn close<H: KernelHeap + ?Sized>(&mut self, heap: &mut H, handle: Self::Handle);
}

/// 解析済み ELF（ロード範囲全体のバッファを所有する）
#[derive(Debug)]
pub struct LoadedElf {
    header: ElfHeader,
    program_headers: Vec<ProgramHeader>,
    /// base の仮想ページに対応する物理アドレス
    buffer: PhysAddr,
    base: VirtAddr,
}

impl LoadedElf {
    fn physical_of(&self, virt: u32) -> Option<PhysAddr> {
        let delta = virt.checked_sub(self.base.0)?;
        self.buffer.offset(delta)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GoblinElfParser;

impl GoblinElfParser {
    pub const fn new() -> Self {
        GoblinElfParser
    }
}

fn read_headers(bytes: &[u8]) -> Result<(ElfHeader, Vec<ProgramHeader>), ElfError> {
    if bytes.len() < SELFMAG || bytes[..SELFMAG] != ELFMAG[..] {
        return Err(ElfError::NotThisFormat);
    }

    let elf = Elf::parse(bytes).map_err(|_| ElfError::Malformed)?;
    if elf.is_64 || !elf.little_endian || elf.header.e_machine != EM_386 {
        return Err(ElfError::Unsupported);
    }

    let mut headers = Vec::new();
    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let end = ph.p_offset.checked_add(ph.p_filesz).ok_or(ElfError::Malformed)?;
        if ph.p_filesz > ph.p_memsz || end > bytes.len() as u64 {
            return Err(ElfError::Malformed);
        }
        if ph.p_vaddr.checked_add(ph.p_memsz).map_or(true, |e| e > u32::MAX as u64) {
            return Err(ElfError::Malformed);
        }
        headers.push(ProgramHeader {
            vaddr: ph.p_vaddr as u32,
            offset: ph.p_offset as u32,
            filesz: ph.p_filesz as u32,
            memsz: ph.p_memsz as u32,
            flags: ph.p_flags,
        });
    }

    if headers.is_empty() {
        return Err(ElfError::Malformed);
    }

    let header = ElfHeader {
        entry: VirtAddr(elf.entry as u32),
        load_segments: headers.len(),
    };
    Ok((header, headers))
}

/// 全セグメントを覆う [ページ先頭, 終端) の仮想範囲
fn load_span(headers: &[ProgramHeader]) -> Option<(VirtAddr, usize)> {
    let start = headers.iter().map(|ph| ph.vaddr).min()?;
    let end = headers.iter().map(|ph| ph.vaddr as u64 + ph.memsz as u64).max()?;
    let base = VirtAddr(start).align_down();
    Some((base, (end - base.0 as u64) as usize))
}

impl ElfParser for GoblinElfParser {
    type Handle = LoadedElf;

    fn parse<H: KernelHeap + ?Sized>(
        &mut self,
        heap: &mut H,
        image: PhysAddr,
        len: usize,
    ) -> Result<LoadedElf, ElfError> {
        // goblin の Elf はヒープを借用するので、ヘッダだけ取り出してから確保に進む
        let (header, program_headers) = {
            let bytes = heap.bytes(image, len).ok_or(ElfError::Malformed)?;
            read_headers(bytes)?
        };

        let (base, size) = load_span(&program_headers).ok_or(ElfError::Malformed)?;
        let buffer = heap.alloc_zeroed(size).ok_or(ElfError::OutOfMemory)?;
        let loaded = LoadedElf {
            header,
            program_headers,
            buffer,
            base,
        };

        for ph in &loaded.program_headers {
            let copied = image
                .offset(ph.offset)
                .zip(loaded.physical_of(ph.vaddr))
                .and_then(|(src, dst)| heap.copy(dst, src, ph.filesz as usize));
            if copied.is_none() {
                heap.free(buffer);
                return Err(ElfError::Malformed);
            }
        }

        Ok(loaded)
    }

    fn header(&self, handle: &LoadedElf) -> ElfHeader {
        handle.header
    }

    fn program_headers<'h>(&self, handle: &'h LoadedElf) -> &'h [ProgramHeader] {
        &handle.program_headers
    }

    fn segment_physical_address(&self, handle: &LoadedElf, index: usize) -> Option<PhysAddr> {
        let ph = handle.program_headers.get(index)?;
        handle.physical_of(ph.vaddr)
    }

    fn close<H: KernelHeap + ?Sized>(&mut self, heap: &mut H, handle: LoadedElf) {
        heap.free(handle.buffer);
    }
}
