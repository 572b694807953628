#![allow(dead_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};

use proc_kernel::arch::Registers;
use proc_kernel::fs::StaticFileStore;
use proc_kernel::kernel::KernelState;
use proc_kernel::loader::elf::GoblinElfParser;
use proc_kernel::mock::{vec_heap, Elf32Builder, Halted, RecordingRuntime, UserModeEntered, VecHeap};

pub type TestKernel =
    KernelState<VecHeap, StaticFileStore<'static>, GoblinElfParser, RecordingRuntime>;

pub const HEAP_BYTES: usize = 32 * 1024 * 1024;

pub const FLAT_PATH: &str = "0:/flat.bin";
pub const ELF_PATH: &str = "0:/prog.elf";
pub const OTHER_PATH: &str = "0:/other.bin";

pub const FLAT_LEN: usize = 5000;

/// 先頭が ELF マジックにならない適当な命令列
pub fn flat_program(len: usize) -> Vec<u8> {
    (0..len).map(|i| if i % 2 == 0 { 0x90 } else { 0xEB }).collect()
}

pub fn elf_program() -> Vec<u8> {
    Elf32Builder::new(0x0040_0000)
        .segment(0x0040_0000, &[0x90, 0x90, 0xEB, 0xFE], 4, false)
        .segment(0x0040_1010, b"hello", 0x20, true)
        .build()
}

/// .text の末尾と .data の先頭が同じ 4KiB ページに載る ELF
pub fn shared_page_program() -> Vec<u8> {
    Elf32Builder::new(0x0040_0000)
        .segment(0x0040_0000, &[0xAA; 0x100], 0x100, false)
        .segment(0x0040_0800, &[0xBB; 0x10], 0x20, true)
        .build()
}

pub fn leak_files(files: Vec<(&'static str, Vec<u8>)>) -> &'static [(&'static str, &'static [u8])] {
    let entries: Vec<(&'static str, &'static [u8])> = files
        .into_iter()
        .map(|(name, data)| (name, &*Box::leak(data.into_boxed_slice())))
        .collect();
    Box::leak(entries.into_boxed_slice())
}

pub fn default_files() -> &'static [(&'static str, &'static [u8])] {
    leak_files(vec![
        (FLAT_PATH, flat_program(FLAT_LEN)),
        (ELF_PATH, elf_program()),
        (OTHER_PATH, flat_program(100)),
    ])
}

pub fn kernel_with_heap(bytes: usize) -> TestKernel {
    kernel_with_files(bytes, default_files())
}

pub fn kernel_with_files(
    bytes: usize,
    files: &'static [(&'static str, &'static [u8])],
) -> TestKernel {
    KernelState::new(
        vec_heap(bytes),
        StaticFileStore::new(files),
        GoblinElfParser::new(),
        RecordingRuntime::default(),
    )
    .unwrap()
}

pub fn kernel() -> TestKernel {
    kernel_with_heap(HEAP_BYTES)
}

/// f が ring3 に入ったら、そのときのレジスタを返す。
pub fn expect_user_mode(f: impl FnOnce()) -> Registers {
    let payload = catch_unwind(AssertUnwindSafe(f)).expect_err("expected a ring3 entry");
    match payload.downcast::<UserModeEntered>() {
        Ok(entered) => entered.0,
        Err(_) => panic!("expected a ring3 entry, got another panic"),
    }
}

/// f がシステムを止めることを確認する。
pub fn expect_halt(f: impl FnOnce()) {
    let payload = catch_unwind(AssertUnwindSafe(f)).expect_err("expected a halt");
    assert!(payload.downcast::<Halted>().is_ok(), "expected a halt, got another panic");
}
