mod common;

use proc_kernel::arch::{InterruptFrame, PrivilegeRuntime};
use proc_kernel::kernel::syscall::Syscall;
use proc_kernel::kernel::{LogEvent, ProcessId, TaskId};
use proc_kernel::mem::addr::{PhysAddr, VirtAddr};
use proc_kernel::mem::layout::{PROGRAM_VIRTUAL_ADDRESS, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use proc_kernel::mm::PhysMemory;
use proc_kernel::KernelError;

use common::{expect_halt, expect_user_mode, kernel, TestKernel, FLAT_PATH, OTHER_PATH};

const SAVED_ESP: u32 = 0x003F_EFF0;

fn frame() -> InterruptFrame {
    InterruptFrame {
        ip: PROGRAM_VIRTUAL_ADDRESS + 0x20,
        cs: USER_CODE_SELECTOR,
        flags: 0x202,
        esp: SAVED_ESP,
        ss: USER_DATA_SELECTOR,
        ..InterruptFrame::default()
    }
}

fn running() -> (TestKernel, ProcessId, TaskId) {
    let mut k = kernel();
    let pid = k.process_load_switch(FLAT_PATH).unwrap();
    let task = k.process_get(pid).unwrap().task();
    (k, pid, task)
}

/// ユーザ側が push した引数をスタックに置いてから int 0x80 を模擬する。
fn call(k: &mut TestKernel, task: TaskId, command: Syscall, arg: u32) -> u32 {
    k.copy_to_task(task, VirtAddr(SAVED_ESP), &arg.to_le_bytes())
        .unwrap();
    k.isr80h_handler(command as u32, &frame())
}

#[test]
fn commands_are_decoded() {
    assert_eq!(Syscall::from_command(4), Some(Syscall::Malloc));
    assert_eq!(Syscall::from_command(9), Some(Syscall::Exit));
    assert_eq!(Syscall::from_command(1), None);
    assert_eq!(Syscall::from_command(3), None);
}

#[test]
fn malloc_returns_a_mapped_pointer_and_free_releases_it() {
    let (mut k, pid, task) = running();

    let ptr = call(&mut k, task, Syscall::Malloc, 64);
    assert_ne!(ptr, 0);
    assert_eq!(k.process_get(pid).unwrap().allocations().len(), 1);

    // 戻り際にはタスクの空間に戻っている
    let dir = k.tasks().get(task).unwrap().address_space().directory();
    assert_eq!(k.runtime().current_directory(), Some(dir));

    assert_eq!(call(&mut k, task, Syscall::Free, ptr), 0);
    assert!(k.process_get(pid).unwrap().allocations().is_empty());

    // 知らないポインタの free は黙って無視
    assert_eq!(call(&mut k, task, Syscall::Free, ptr), 0);
}

#[test]
fn getkey_drains_the_callers_keyboard_buffer() {
    let (mut k, _pid, task) = running();
    k.keyboard_push(b'o');
    k.keyboard_push(b'k');
    k.keyboard_push(b'x');
    k.keyboard_backspace();

    assert_eq!(call(&mut k, task, Syscall::GetKey, 0), b'o' as u32);
    assert_eq!(call(&mut k, task, Syscall::GetKey, 0), b'k' as u32);
    assert_eq!(call(&mut k, task, Syscall::GetKey, 0), 0);
}

#[test]
fn get_arguments_fills_the_callers_struct() {
    let (mut k, pid, task) = running();
    k.process_inject_arguments(pid, &["shell", "a"]).unwrap();
    let out = k.process_malloc(pid, 8).unwrap();

    assert_eq!(call(&mut k, task, Syscall::GetArguments, out.0), 0);

    let args = k.process_arguments(pid).unwrap();
    assert_eq!(k.heap().read_u32(PhysAddr(out.0)), Some(2));
    assert_eq!(k.heap().read_u32(PhysAddr(out.0 + 4)), Some(args.argv.0));
}

#[test]
fn unknown_command_reports_invalid_argument() {
    let (mut k, _pid, _task) = running();
    let status = k.isr80h_handler(77, &frame());
    assert_eq!(status, KernelError::InvalidArgument.status() as u32);
    assert!(k.events().any(|e| *e == LogEvent::SyscallHandled(77)));
}

#[test]
fn process_load_start_enters_the_new_program() {
    let (mut k, pid, task) = running();
    let name = k.process_malloc(pid, 32).unwrap();
    k.copy_to_task(task, name, b"other.bin\0").unwrap();

    let regs = expect_user_mode(|| {
        call(&mut k, task, Syscall::ProcessLoadStart, name.0);
    });
    assert_eq!(regs.ip, PROGRAM_VIRTUAL_ADDRESS);

    assert_eq!(k.process_count(), 2);
    let started = k.process_current().unwrap();
    assert_ne!(started, pid);
    assert_eq!(k.process_get(started).unwrap().path(), OTHER_PATH);
    let new_task = k.process_get(started).unwrap().task();
    let dir = k.tasks().get(new_task).unwrap().address_space().directory();
    assert_eq!(k.runtime().current_directory(), Some(dir));
}

#[test]
fn process_load_start_with_a_bad_name_returns_to_the_caller() {
    let (mut k, pid, task) = running();
    let name = k.process_malloc(pid, 32).unwrap();
    k.copy_to_task(task, name, b"nope.bin\0").unwrap();

    let status = call(&mut k, task, Syscall::ProcessLoadStart, name.0);
    assert_eq!(status, KernelError::NotFound.status() as u32);
    assert_eq!(k.process_count(), 1);
    assert_eq!(k.process_current(), Some(pid));
}

#[test]
fn exit_hands_the_cpu_to_the_next_task() {
    let (mut k, pid, task) = running();
    let other = k.process_load(OTHER_PATH).unwrap();
    let other_task = k.process_get(other).unwrap().task();

    expect_user_mode(|| {
        call(&mut k, task, Syscall::Exit, 0);
    });
    assert!(k.process_get(pid).is_none());
    assert_eq!(k.process_current(), Some(other));
    assert_eq!(k.tasks().current(), Some(other_task));
    assert_eq!(k.debug_check_invariants(), 0);
}

#[test]
fn exit_of_the_last_process_halts() {
    let (mut k, _pid, task) = running();
    expect_halt(|| {
        call(&mut k, task, Syscall::Exit, 0);
    });
    assert_eq!(k.process_count(), 0);
}
