// kernel/src/mock.rs
//
// ホスト上のテスト用の差し替え部品（std feature / cfg(test) のときだけ）。
// - vec_heap(): Vec で模擬した物理メモリ + カーネルヒープ
// - RecordingRuntime: CR3 の読み込みを記録し、ring3 遷移と停止は panic で表す
// - FailingFileStore: 開けるが読めないファイルストア
// - Elf32Builder: テスト用の最小 ELF32 イメージを組み立てる

extern crate std;

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::{PrivilegeRuntime, Registers};
use crate::fs::{FileError, FileStat, FileStore, OpenMode};
use crate::mem::addr::PhysAddr;
use crate::mm::{BlockHeap, HEAP_BLOCK_SIZE};

pub type VecHeap = BlockHeap<Vec<u8>, Vec<u8>>;

/// テスト用ヒープの先頭（実機のカーネルヒープと同じ位置）
pub const TEST_HEAP_BASE: PhysAddr = PhysAddr(0x0100_0000);

/// bytes バイト（ブロック単位に切り捨て）のヒープを作る。
pub fn vec_heap(bytes: usize) -> VecHeap {
    let blocks = bytes / HEAP_BLOCK_SIZE;
    BlockHeap::new(
        TEST_HEAP_BASE,
        vec![0u8; blocks * HEAP_BLOCK_SIZE],
        vec![0u8; blocks],
    )
    .expect("test heap geometry")
}

/// enter_user_mode() が投げる panic ペイロード
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserModeEntered(pub Registers);

/// halt() が投げる panic ペイロード
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Halted;

#[derive(Debug, Default)]
pub struct RecordingRuntime {
    pub loaded_directories: Vec<PhysAddr>,
}

impl PrivilegeRuntime for RecordingRuntime {
    fn load_page_directory(&mut self, directory: PhysAddr) {
        self.loaded_directories.push(directory);
    }

    fn current_directory(&self) -> Option<PhysAddr> {
        self.loaded_directories.last().copied()
    }

    fn enter_user_mode(&mut self, regs: &Registers) -> ! {
        std::panic::panic_any(UserModeEntered(*regs))
    }

    fn halt(&mut self) -> ! {
        std::panic::panic_any(Halted)
    }
}

/// 開けるが読み出しは必ず Io で失敗する
#[derive(Debug, Default)]
pub struct FailingFileStore {
    pub open_handles: usize,
}

impl FileStore for FailingFileStore {
    type Handle = ();

    fn open(&mut self, _path: &str, _mode: OpenMode) -> Result<(), FileError> {
        self.open_handles += 1;
        Ok(())
    }

    fn stat(&mut self, _handle: ()) -> Result<FileStat, FileError> {
        Ok(FileStat { size: 64, flags: 0 })
    }

    fn read(&mut self, _h: (), _out: &mut [u8], _size: usize, _count: usize) -> Result<usize, FileError> {
        Err(FileError::Io)
    }

    fn close(&mut self, _handle: ()) -> Result<(), FileError> {
        self.open_handles -= 1;
        Ok(())
    }
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct SegmentSpec {
    vaddr: u32,
    data: Vec<u8>,
    memsz: u32,
    flags: u32,
}

/// 最小限の ELF32 (i386, little endian, ET_EXEC) を組み立てる。セクションヘッダは付けない。
pub struct Elf32Builder {
    entry: u32,
    machine: u16,
    segments: Vec<SegmentSpec>,
}

impl Elf32Builder {
    pub fn new(entry: u32) -> Self {
        Elf32Builder {
            entry,
            machine: 3,
            segments: Vec::new(),
        }
    }

    /// PT_LOAD セグメントを足す。memsz が data より大きければ残りは bss。
    pub fn segment(mut self, vaddr: u32, data: &[u8], memsz: u32, writable: bool) -> Self {
        let mut flags = PF_R | PF_X;
        if writable {
            flags |= PF_W;
        }
        self.segments.push(SegmentSpec {
            vaddr,
            data: data.to_vec(),
            memsz,
            flags,
        });
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = Vec::new();

        // e_ident
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        push16(&mut out, 2); // e_type = ET_EXEC
        push16(&mut out, self.machine);
        push32(&mut out, 1); // e_version
        push32(&mut out, self.entry);
        push32(&mut out, EHDR_SIZE as u32); // e_phoff
        push32(&mut out, 0); // e_shoff
        push32(&mut out, 0); // e_flags
        push16(&mut out, EHDR_SIZE as u16);
        push16(&mut out, PHDR_SIZE as u16);
        push16(&mut out, phnum as u16);
        push16(&mut out, 40); // e_shentsize
        push16(&mut out, 0); // e_shnum
        push16(&mut out, 0); // e_shstrndx

        let mut offset = EHDR_SIZE + PHDR_SIZE * phnum;
        for seg in &self.segments {
            push32(&mut out, PT_LOAD);
            push32(&mut out, offset as u32);
            push32(&mut out, seg.vaddr);
            push32(&mut out, seg.vaddr); // p_paddr
            push32(&mut out, seg.data.len() as u32);
            push32(&mut out, seg.memsz);
            push32(&mut out, seg.flags);
            push32(&mut out, 0x1000);
            offset += seg.data.len();
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}

fn push16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
