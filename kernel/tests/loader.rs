mod common;

use proc_kernel::fs::StaticFileStore;
use proc_kernel::loader::elf::{ElfParser, GoblinElfParser};
use proc_kernel::loader::{self, Image, ImageKind};
use proc_kernel::mem::addr::VirtAddr;
use proc_kernel::mem::layout::PROGRAM_VIRTUAL_ADDRESS;
use proc_kernel::mem::paging::PageFlags;
use proc_kernel::mm::PhysMemory;
use proc_kernel::mock::{vec_heap, Elf32Builder, FailingFileStore};
use proc_kernel::KernelError;

use common::{elf_program, flat_program, leak_files, shared_page_program};

const HEAP_BYTES: usize = 4 * 1024 * 1024;

#[test]
fn non_elf_file_falls_back_to_flat_binary() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/flat.bin", flat_program(5000))]));
    let mut parser = GoblinElfParser::new();

    let image = loader::load(&mut heap, &mut files, &mut parser, None, "0:/flat.bin").unwrap();
    assert_eq!(image.kind(), ImageKind::FlatBinary);
    assert_eq!(files.open_count(), 0);

    let desc = image.descriptor(&parser).unwrap();
    assert_eq!(desc.entry, VirtAddr(PROGRAM_VIRTUAL_ADDRESS));
    assert_eq!(desc.segments.len(), 1);
    let seg = desc.segments[0];
    assert_eq!(seg.virt, VirtAddr(PROGRAM_VIRTUAL_ADDRESS));
    assert_eq!(seg.len, 5000);
    assert_eq!(seg.flags(), PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER);
    assert_eq!(heap.bytes(seg.phys, 5000).unwrap(), &flat_program(5000)[..]);

    image.release(&mut heap, &mut parser);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn elf_segments_are_copied_with_bss_zeroed() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/prog.elf", elf_program())]));
    let mut parser = GoblinElfParser::new();

    let image = loader::load(&mut heap, &mut files, &mut parser, None, "0:/prog.elf").unwrap();
    assert_eq!(image.kind(), ImageKind::Elf);
    // ファイル全体のバッファは返却済み、残るのはロード範囲 2 ページ分
    assert_eq!(heap.used_blocks(), 2);

    let desc = image.descriptor(&parser).unwrap();
    assert_eq!(desc.entry, VirtAddr(0x0040_0000));
    assert_eq!(desc.segments.len(), 2);

    let text = desc.segments[0];
    assert_eq!(text.virt, VirtAddr(0x0040_0000));
    assert_eq!(text.len, 4);
    assert!(!text.flags().contains(PageFlags::WRITABLE));
    assert_eq!(heap.bytes(text.phys, 4).unwrap(), &[0x90u8, 0x90, 0xEB, 0xFE][..]);

    let data = desc.segments[1];
    assert_eq!(data.virt, VirtAddr(0x0040_1010));
    assert_eq!(data.len, 0x20);
    assert!(data.flags().contains(PageFlags::WRITABLE));
    // 仮想アドレスのページ内オフセットを物理側でも保つ
    assert_eq!(data.phys.page_offset(), 0x010);

    let bytes = heap.bytes(data.phys, 0x20).unwrap();
    assert_eq!(&bytes[..5], b"hello");
    assert!(bytes[5..].iter().all(|&b| b == 0));

    image.release(&mut heap, &mut parser);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn flat_binary_hint_skips_elf_parsing() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/prog.elf", elf_program())]));
    let mut parser = GoblinElfParser::new();

    let image = loader::load(
        &mut heap,
        &mut files,
        &mut parser,
        Some(ImageKind::FlatBinary),
        "0:/prog.elf",
    )
    .unwrap();
    match &image {
        Image::FlatBinary { size, .. } => assert_eq!(*size, elf_program().len()),
        Image::Elf(_) => panic!("hint ignored"),
    }
    image.release(&mut heap, &mut parser);
}

#[test]
fn elf_hint_on_flat_file_is_unsupported() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/flat.bin", flat_program(64))]));
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, Some(ImageKind::Elf), "0:/flat.bin")
        .unwrap_err();
    assert_eq!(err, KernelError::UnsupportedFormat);
    assert_eq!(heap.used_blocks(), 0);
    assert_eq!(files.open_count(), 0);
}

#[test]
fn foreign_machine_is_unsupported() {
    let mut heap = vec_heap(HEAP_BYTES);
    let arm = Elf32Builder::new(0x0040_0000)
        .segment(0x0040_0000, &[0; 16], 16, false)
        .machine(40)
        .build();
    let mut files = StaticFileStore::new(leak_files(vec![("0:/arm.elf", arm)]));
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, None, "0:/arm.elf").unwrap_err();
    assert_eq!(err, KernelError::UnsupportedFormat);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn truncated_segment_is_unsupported() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut image = Elf32Builder::new(0x0040_0000)
        .segment(0x0040_0000, &[0x90; 64], 64, false)
        .build();
    image.truncate(image.len() - 32);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/short.elf", image)]));
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, None, "0:/short.elf").unwrap_err();
    assert_eq!(err, KernelError::UnsupportedFormat);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn missing_file_is_not_found() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![]));
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, None, "0:/nope.bin").unwrap_err();
    assert_eq!(err, KernelError::NotFound);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn empty_file_is_unsupported() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/empty.bin", Vec::new())]));
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, None, "0:/empty.bin").unwrap_err();
    assert_eq!(err, KernelError::UnsupportedFormat);
    assert_eq!(files.open_count(), 0);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn read_failure_closes_the_file_and_frees_the_buffer() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = FailingFileStore::default();
    let mut parser = GoblinElfParser::new();

    let err = loader::load(&mut heap, &mut files, &mut parser, None, "0:/any.bin").unwrap_err();
    assert_eq!(err, KernelError::Io);
    assert_eq!(files.open_handles, 0);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn segments_sharing_a_page_share_one_physical_page() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/shared.elf", shared_page_program())]));
    let mut parser = GoblinElfParser::new();

    let image = loader::load(&mut heap, &mut files, &mut parser, None, "0:/shared.elf").unwrap();
    assert_eq!(heap.used_blocks(), 1);

    let desc = image.descriptor(&parser).unwrap();
    let (text, data) = (desc.segments[0], desc.segments[1]);
    assert_eq!(text.phys.align_down(), data.phys.align_down());
    assert_eq!(data.phys.page_offset(), 0x800);
    assert_eq!(heap.bytes(text.phys, 0x100).unwrap(), &[0xAAu8; 0x100][..]);

    let bytes = heap.bytes(data.phys, 0x20).unwrap();
    assert_eq!(&bytes[..0x10], &[0xBBu8; 0x10][..]);
    assert!(bytes[0x10..].iter().all(|&b| b == 0));

    image.release(&mut heap, &mut parser);
    assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn parser_reports_load_segments() {
    let mut heap = vec_heap(HEAP_BYTES);
    let mut files = StaticFileStore::new(leak_files(vec![("0:/prog.elf", elf_program())]));
    let mut parser = GoblinElfParser::new();

    let image = loader::load(&mut heap, &mut files, &mut parser, None, "0:/prog.elf").unwrap();
    let Image::Elf(handle) = &image else {
        panic!("expected an ELF image");
    };
    assert_eq!(parser.header(handle).load_segments, 2);
    let headers = parser.program_headers(handle);
    assert_eq!(headers[1].filesz, 5);
    assert_eq!(headers[1].memsz, 0x20);
    assert!(headers[1].is_writable());
    assert!(parser.segment_physical_address(handle, 2).is_none());

    image.release(&mut heap, &mut parser);
}
