// kernel/src/loader/mod.rs
//
// 実行イメージのロード。
//
// - ファイルは 1 回だけ読み、カーネルヒープ上のバッファに置く。
// - 種類の指定がなければ、まず ELF として解釈を試み、
//   ELF でないと分かったら同じバッファをフラットバイナリとして使う。
//   （ELF マジックで始まるフラットバイナリは区別できない）
// - ロード結果は Image（種類ごとのタグ付き）で、解放方法も種類ごとに違う。
// - ImageDescriptor はマッピングを組むための一時的な説明で、何も所有しない。

pub mod elf;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::KernelError;
use crate::fs::{FileStore, OpenMode};
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::layout::PROGRAM_VIRTUAL_ADDRESS;
use crate::mem::paging::PageFlags;
use crate::mm::KernelHeap;

use self::elf::{ElfError, ElfParser};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    FlatBinary,
    Elf,
}

/// ロード済みイメージ
#[derive(Debug)]
pub enum Image<E> {
    FlatBinary { data: PhysAddr, size: usize },
    Elf(E),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub len: usize,
    pub writable: bool,
}

impl Segment {
    pub fn flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if self.writable {
            flags |= PageFlags::WRITABLE;
        }
        flags
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
}

impl<E> Image<E> {
    pub fn kind(&self) -> ImageKind {
        match self {
            Image::FlatBinary { .. } => ImageKind::FlatBinary,
            Image::Elf(_) => ImageKind::Elf,
        }
    }

    pub fn descriptor<P>(&self, parser: &P) -> Result<ImageDescriptor, KernelError>
    where
        P: ElfParser<Handle = E>,
    {
        match self {
            Image::FlatBinary { data, size } => Ok(ImageDescriptor {
                entry: VirtAddr(PROGRAM_VIRTUAL_ADDRESS),
                segments: vec![Segment {
                    virt: VirtAddr(PROGRAM_VIRTUAL_ADDRESS),
                    phys: *data,
                    len: *size,
                    writable: true,
                }],
            }),
            Image::Elf(handle) => {
                let header = parser.header(handle);
                let mut segments = Vec::with_capacity(header.load_segments);
                for (i, ph) in parser.program_headers(handle).iter().enumerate() {
                    let phys = parser
                        .segment_physical_address(handle, i)
                        .ok_or(KernelError::UnsupportedFormat)?;
                    segments.push(Segment {
                        virt: VirtAddr(ph.vaddr),
                        phys,
                        len: ph.memsz as usize,
                        writable: ph.is_writable(),
                    });
                }
                Ok(ImageDescriptor {
                    entry: header.entry,
                    segments,
                })
            }
        }
    }

    /// 種類ごとの方法で解放する。
    pub fn release<H, P>(self, heap: &mut H, parser: &mut P)
    where
        H: KernelHeap + ?Sized,
        P: ElfParser<Handle = E>,
    {
        match self {
            Image::FlatBinary { data, .. } => heap.free(data),
            Image::Elf(handle) => parser.close(heap, handle),
        }
    }
}

/// path のファイルを読み、実行イメージにする。
pub fn load<H, F, P>(
    heap: &mut H,
    files: &mut F,
    parser: &mut P,
    hint: Option<ImageKind>,
    path: &str,
) -> Result<Image<P::Handle>, KernelError>
where
    H: KernelHeap + ?Sized,
    F: FileStore + ?Sized,
    P: ElfParser,
{
    let handle = files.open(path, OpenMode::Read)?;
    let read = read_whole(heap, files, handle);
    if files.close(handle).is_err() {
        logging::warn("loader: close failed");
    }
    let (data, size) = read?;

    if hint == Some(ImageKind::FlatBinary) {
        return Ok(Image::FlatBinary { data, size });
    }

    match parser.parse(heap, data, size) {
        Ok(parsed) => {
            // セグメントは parser 側のバッファにコピー済み
            heap.free(data);
            Ok(Image::Elf(parsed))
        }
        Err(ElfError::NotThisFormat) if hint.is_none() => Ok(Image::FlatBinary { data, size }),
        Err(e) => {
            heap.free(data);
            Err(e.into())
        }
    }
}

fn read_whole<H, F>(
    heap: &mut H,
    files: &mut F,
    handle: F::Handle,
) -> Result<(PhysAddr, usize), KernelError>
where
    H: KernelHeap + ?Sized,
    F: FileStore + ?Sized,
{
    let size = files.stat(handle)?.size as usize;
    if size == 0 {
        return Err(KernelError::UnsupportedFormat);
    }

    let data = heap.alloc_zeroed(size).ok_or(KernelError::OutOfMemory)?;
    let read = match heap.bytes_mut(data, size) {
        Some(buf) => files.read(handle, buf, size, 1).map_err(KernelError::from),
        None => Err(KernelError::OutOfMemory),
    };

    match read {
        Ok(1) => Ok((data, size)),
        Ok(_) => {
            heap.free(data);
            Err(KernelError::Io)
        }
        Err(e) => {
            heap.free(data);
            Err(e)
        }
    }
}
