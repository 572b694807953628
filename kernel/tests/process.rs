mod common;

use proc_kernel::kernel::{LogEvent, ProcessId, MAX_PROCESSES, MAX_PROGRAM_ALLOCATIONS};
use proc_kernel::loader::{Image, ImageKind};
use proc_kernel::mem::addr::{PhysAddr, VirtAddr};
use proc_kernel::mem::layout::{
    PROGRAM_VIRTUAL_ADDRESS, USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_STACK_END,
    USER_STACK_START,
};
use proc_kernel::mem::paging::PageFlags;
use proc_kernel::mm::PhysMemory;
use proc_kernel::mock::Elf32Builder;
use proc_kernel::kernel::task::USER_INITIAL_FLAGS;
use proc_kernel::KernelError;

use common::{
    kernel, kernel_with_files, kernel_with_heap, leak_files, shared_page_program, TestKernel,
    ELF_PATH, FLAT_LEN, FLAT_PATH, HEAP_BYTES, OTHER_PATH,
};

fn rw_user() -> PageFlags {
    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER
}

fn translate(k: &TestKernel, pid: ProcessId, virt: u32) -> Option<PhysAddr> {
    let task = k.process_get(pid).unwrap().task();
    k.tasks()
        .get(task)
        .unwrap()
        .address_space()
        .translate(k.heap(), VirtAddr(virt))
}

fn flags_at(k: &TestKernel, pid: ProcessId, virt: u32) -> PageFlags {
    let task = k.process_get(pid).unwrap().task();
    k.tasks()
        .get(task)
        .unwrap()
        .address_space()
        .entry(k.heap(), VirtAddr(virt))
        .unwrap()
        .flags()
}

#[test]
fn load_does_not_switch_until_asked() {
    let mut k = kernel();
    assert_eq!(k.process_current(), None);

    let a = k.process_load(FLAT_PATH).unwrap();
    assert_eq!(a, ProcessId(0));
    assert_eq!(k.process_current(), None);
    assert_eq!(k.process_count(), 1);

    let b = k.process_load_switch(OTHER_PATH).unwrap();
    assert_eq!(b, ProcessId(1));
    assert_eq!(k.process_current(), Some(b));

    k.process_switch(a).unwrap();
    assert_eq!(k.process_current(), Some(a));
    assert_eq!(k.process_switch(ProcessId(5)), Err(KernelError::NotFound));
    assert_eq!(k.debug_check_invariants(), 0);
}

#[test]
fn flat_binary_is_mapped_page_by_page_at_the_program_address() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();

    let p = k.process_get(pid).unwrap();
    assert_eq!(p.image_kind(), ImageKind::FlatBinary);
    assert_eq!(p.path(), FLAT_PATH);
    let Image::FlatBinary { data, size } = *p.image() else {
        panic!("expected a flat binary");
    };
    assert_eq!(size, FLAT_LEN);

    // 5000 バイト → 2 ページ
    for page in 0..2u32 {
        let virt = PROGRAM_VIRTUAL_ADDRESS + page * 0x1000;
        assert_eq!(translate(&k, pid, virt), Some(PhysAddr(data.0 + page * 0x1000)));
        assert_eq!(flags_at(&k, pid, virt), rw_user());
    }
    let third = PROGRAM_VIRTUAL_ADDRESS + 0x2000;
    assert_eq!(translate(&k, pid, third), Some(PhysAddr(third)));
    assert!(!flags_at(&k, pid, third).contains(PageFlags::WRITABLE));
}

#[test]
fn new_task_starts_at_entry_with_user_selectors() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();
    let task = k.process_get(pid).unwrap().task();

    let regs = *k.tasks().get(task).unwrap().registers();
    assert_eq!(regs.ip, PROGRAM_VIRTUAL_ADDRESS);
    assert_eq!(regs.esp, USER_STACK_START);
    assert_eq!(regs.cs, USER_CODE_SELECTOR);
    assert_eq!(regs.ss, USER_DATA_SELECTOR);
    assert_eq!(regs.flags, USER_INITIAL_FLAGS);
    assert_eq!(regs.eax, 0);
    assert_eq!(k.tasks().get(task).unwrap().process(), pid);
}

#[test]
fn stack_is_mapped_below_the_stack_start() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();
    let stack = k.process_get(pid).unwrap().stack();

    assert_eq!(translate(&k, pid, USER_STACK_END), Some(stack));
    assert_eq!(
        translate(&k, pid, USER_STACK_START - 4),
        Some(PhysAddr(stack.0 + 0x4000 - 4))
    );
    assert_eq!(flags_at(&k, pid, USER_STACK_END), rw_user());
}

#[test]
fn elf_segments_are_mapped_with_their_own_permissions() {
    let mut k = kernel();
    let pid = k.process_load(ELF_PATH).unwrap();
    assert_eq!(k.process_get(pid).unwrap().image_kind(), ImageKind::Elf);

    let text = translate(&k, pid, 0x0040_0000).unwrap();
    assert_eq!(k.heap().bytes(text, 4).unwrap(), &[0x90u8, 0x90, 0xEB, 0xFE][..]);
    assert!(!flags_at(&k, pid, 0x0040_0000).contains(PageFlags::WRITABLE));

    let data = translate(&k, pid, 0x0040_1010).unwrap();
    assert_eq!(k.heap().bytes(data, 5).unwrap(), b"hello");
    assert_eq!(flags_at(&k, pid, 0x0040_1000), rw_user());
}

fn read_user(k: &TestKernel, pid: ProcessId, virt: u32, out: &mut [u8]) {
    let task = k.process_get(pid).unwrap().task();
    k.tasks()
        .get(task)
        .unwrap()
        .address_space()
        .read_bytes(k.heap(), VirtAddr(virt), out)
        .unwrap();
}

#[test]
fn segments_sharing_a_page_keep_both_contents() {
    let mut k = kernel_with_files(
        HEAP_BYTES,
        leak_files(vec![("0:/shared.elf", shared_page_program())]),
    );
    let pid = k.process_load("0:/shared.elf").unwrap();

    let mut out = [0u8; 4];
    read_user(&k, pid, 0x0040_0000, &mut out);
    assert_eq!(out, [0xAA; 4]);
    read_user(&k, pid, 0x0040_0800, &mut out);
    assert_eq!(out, [0xBB; 4]);
    assert_eq!(flags_at(&k, pid, 0x0040_0000), rw_user());
}

#[test]
fn shared_page_stays_writable_whatever_the_segment_order() {
    let elf = Elf32Builder::new(0x0040_0800)
        .segment(0x0040_0000, &[0xBB; 0x10], 0x10, true)
        .segment(0x0040_0800, &[0xAA; 0x10], 0x10, false)
        .build();
    let mut k = kernel_with_files(HEAP_BYTES, leak_files(vec![("0:/rev.elf", elf)]));
    let pid = k.process_load("0:/rev.elf").unwrap();

    assert_eq!(flags_at(&k, pid, 0x0040_0800), rw_user());
    let mut out = [0u8; 2];
    read_user(&k, pid, 0x0040_000F, &mut out);
    assert_eq!(out, [0xBB, 0]);
}

#[test]
fn failed_load_leaves_no_trace() {
    let mut k = kernel();
    let baseline = k.heap().used_blocks();

    assert_eq!(k.process_load("0:/missing.bin"), Err(KernelError::NotFound));
    let long = format!("0:/{}", "x".repeat(200));
    assert_eq!(k.process_load(&long), Err(KernelError::InvalidArgument));
    assert_eq!(k.process_load(""), Err(KernelError::InvalidArgument));

    assert_eq!(k.process_count(), 0);
    assert!(k.tasks().is_empty());
    assert_eq!(k.heap().used_blocks(), baseline);
}

#[test]
fn explicit_slots_are_checked() {
    let mut k = kernel();
    let pid = k.process_load_for_slot(FLAT_PATH, None, ProcessId(3)).unwrap();
    assert_eq!(pid, ProcessId(3));

    assert_eq!(
        k.process_load_for_slot(OTHER_PATH, None, ProcessId(3)),
        Err(KernelError::ResourceExhausted)
    );
    assert_eq!(
        k.process_load_for_slot(OTHER_PATH, None, ProcessId(MAX_PROCESSES)),
        Err(KernelError::InvalidArgument)
    );
    // 次の自動割り当ては空いている先頭のスロット
    assert_eq!(k.process_load(OTHER_PATH), Ok(ProcessId(0)));
}

#[test]
fn full_table_is_resource_exhausted() {
    let mut k = kernel_with_heap(64 * 1024 * 1024);
    for i in 0..MAX_PROCESSES {
        assert_eq!(k.process_load(OTHER_PATH), Ok(ProcessId(i)));
    }
    let used = k.heap().used_blocks();

    assert_eq!(k.process_load(OTHER_PATH), Err(KernelError::ResourceExhausted));
    assert_eq!(k.process_count(), MAX_PROCESSES);
    assert_eq!(k.heap().used_blocks(), used);
    assert_eq!(k.debug_check_invariants(), 0);
}

#[test]
fn malloc_is_identity_mapped_and_free_unmaps() {
    let mut k = kernel();
    let pid = k.process_load_switch(FLAT_PATH).unwrap();

    let ptr = k.process_malloc(pid, 100).unwrap();
    assert_eq!(translate(&k, pid, ptr.0), Some(PhysAddr(ptr.0)));
    assert_eq!(flags_at(&k, pid, ptr.0), rw_user());
    assert_eq!(k.process_get(pid).unwrap().allocations().len(), 1);

    k.process_free(pid, ptr).unwrap();
    assert_eq!(translate(&k, pid, ptr.0), None);
    assert!(k.process_get(pid).unwrap().allocations().is_empty());

    // 空いた記録とブロックは再利用される
    let again = k.process_malloc(pid, 100).unwrap();
    assert_eq!(again, ptr);
    assert_eq!(k.process_get(pid).unwrap().allocations().len(), 1);
}

#[test]
fn zero_sized_malloc_still_gets_a_block() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();

    let a = k.process_malloc(pid, 0).unwrap();
    let b = k.process_malloc(pid, 0).unwrap();
    assert_ne!(a, b);
    assert_eq!(translate(&k, pid, a.0), Some(PhysAddr(a.0)));
}

#[test]
fn full_allocation_table_takes_no_heap_block() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();
    for _ in 0..MAX_PROGRAM_ALLOCATIONS {
        k.process_malloc(pid, 16).unwrap();
    }
    let used = k.heap().used_blocks();

    assert_eq!(k.process_malloc(pid, 16), Err(KernelError::OutOfMemory));
    assert_eq!(k.heap().used_blocks(), used);
    assert_eq!(
        k.process_get(pid).unwrap().allocations().len(),
        MAX_PROGRAM_ALLOCATIONS
    );
}

#[test]
fn freeing_an_unknown_pointer_changes_nothing() {
    let mut k = kernel();
    let pid = k.process_load(FLAT_PATH).unwrap();
    let ptr = k.process_malloc(pid, 32).unwrap();
    let used = k.heap().used_blocks();

    assert_eq!(
        k.process_free(pid, VirtAddr(ptr.0 + 0x1000)),
        Err(KernelError::UnknownResource)
    );
    assert_eq!(k.process_get(pid).unwrap().allocations().len(), 1);
    assert_eq!(k.heap().used_blocks(), used);
    assert_eq!(k.process_free(ProcessId(7), ptr), Err(KernelError::NotFound));
}

#[test]
fn arguments_are_written_into_process_memory() {
    let mut k = kernel();
    let pid = k.process_load_switch(FLAT_PATH).unwrap();
    let task = k.process_get(pid).unwrap().task();

    assert_eq!(k.process_inject_arguments(pid, &[]), Err(KernelError::Io));
    k.process_inject_arguments(pid, &["shell", "-v"]).unwrap();

    let args = k.process_arguments(pid).unwrap();
    assert_eq!(args.argc, 2);
    // argv 配列と文字列 2 つ
    assert_eq!(k.process_get(pid).unwrap().allocations().len(), 3);

    let expected = ["shell", "-v"];
    for (i, want) in expected.iter().enumerate() {
        let ptr = k.heap().read_u32(PhysAddr(args.argv.0 + i as u32 * 4)).unwrap();
        let got = k.copy_string_from_task(task, VirtAddr(ptr), 64).unwrap();
        assert_eq!(got, *want);
    }
}

#[test]
fn terminating_the_current_process_switches_to_a_survivor() {
    let mut k = kernel();
    let a = k.process_load_switch(FLAT_PATH).unwrap();
    let b = k.process_load(ELF_PATH).unwrap();

    k.process_terminate(a).unwrap();
    assert_eq!(k.process_current(), Some(b));
    assert!(k.process_get(a).is_none());
    assert_eq!(k.tasks().len(), 1);
    let current_task = k.tasks().current().unwrap();
    assert_eq!(k.tasks().get(current_task).unwrap().process(), b);
    assert_eq!(k.debug_check_invariants(), 0);
}

#[test]
fn terminating_another_process_keeps_the_current_one() {
    let mut k = kernel();
    let a = k.process_load_switch(FLAT_PATH).unwrap();
    let b = k.process_load(OTHER_PATH).unwrap();

    k.process_terminate(b).unwrap();
    assert_eq!(k.process_current(), Some(a));
    assert_eq!(k.process_terminate(b), Err(KernelError::NotFound));
}

#[test]
fn terminating_everything_returns_the_heap_to_its_baseline() {
    let mut k = kernel();
    let baseline = k.heap().used_blocks();

    let a = k.process_load_switch(FLAT_PATH).unwrap();
    let b = k.process_load(ELF_PATH).unwrap();
    k.process_malloc(a, 5000).unwrap();
    k.process_inject_arguments(b, &["prog", "one", "two"]).unwrap();

    k.process_terminate(a).unwrap();
    assert_eq!(k.process_terminate(b), Err(KernelError::NoProcessLeft));

    assert_eq!(k.process_count(), 0);
    assert_eq!(k.process_current(), None);
    assert!(k.tasks().is_empty());
    assert_eq!(k.heap().used_blocks(), baseline);
    assert_eq!(k.debug_check_invariants(), 0);
}

#[test]
fn lifecycle_is_recorded_in_the_event_log() {
    let mut k = kernel();
    let pid = k.process_load_switch(FLAT_PATH).unwrap();
    let task = k.process_get(pid).unwrap().task();
    let _ = k.process_terminate(pid);

    let events: Vec<LogEvent> = k.events().copied().collect();
    assert_eq!(
        events,
        vec![
            LogEvent::TaskCreated(task),
            LogEvent::ProcessLoaded(pid),
            LogEvent::ProcessSwitched(pid),
            LogEvent::TaskFreed(task),
            LogEvent::ProcessTerminated(pid),
        ]
    );
}
