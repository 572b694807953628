// kernel/src/kernel/entry.rs
//
// proc-kernel: kernel entry glue（i686 ベアメタルのみ）
//
// 役割:
// - カーネルヒープ（固定アドレス）と Rust 用のアロケータを用意する
// - KernelState を作ってカーネル空間でページングを有効にする
// - 最初のプログラムをロードして ring3 に入る
// - 外部の割り込みスタブから呼ばれる入口（int 0x80 / キーボード）を提供する
//
// やらないこと:
// - GDT / TSS / IDT の設定（ブート側の責務）

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use crate::arch::{cpu, paging, InterruptFrame, X86Runtime};
use crate::error::KernelError;
use crate::fs::StaticFileStore;
use crate::loader::elf::GoblinElfParser;
use crate::logging;
use crate::mem::addr::PhysAddr;
use crate::mem::layout::{KERNEL_HEAP_ADDRESS, KERNEL_HEAP_SIZE_BYTES, KERNEL_HEAP_TABLE_ADDRESS};
use crate::mm::{BlockHeap, KernelHeap, HEAP_BLOCK_SIZE};

use super::{state_ref, KernelState};

pub type BootHeap = BlockHeap<&'static mut [u8], &'static mut [u8]>;
pub type BootKernel =
    KernelState<BootHeap, StaticFileStore<'static>, GoblinElfParser, X86Runtime>;

/// Rust の alloc（Vec / Box / String）用の領域。カーネルヒープとは別にする。
const RUST_HEAP_ADDRESS: u32 = 0x0080_0000;
const RUST_HEAP_BLOCKS: usize = 1024;

static mut RUST_HEAP_TABLE: [u8; RUST_HEAP_BLOCKS] = [0; RUST_HEAP_BLOCKS];

struct LockedBlockHeap(Mutex<Option<BootHeap>>);

unsafe impl GlobalAlloc for LockedBlockHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_BLOCK_SIZE {
            return ptr::null_mut();
        }
        match self.0.lock().as_mut().and_then(|h| h.alloc(layout.size())) {
            Some(addr) => addr.0 as usize as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        if let Some(h) = self.0.lock().as_mut() {
            h.free(PhysAddr(p as usize as u32));
        }
    }
}

#[global_allocator]
static ALLOCATOR: LockedBlockHeap = LockedBlockHeap(Mutex::new(None));

/// # Safety
/// 固定アドレスの領域が恒等マップされ、他に使われていないこと。1 回だけ呼ぶこと。
unsafe fn init_rust_heap() -> Result<(), KernelError> {
    let storage = core::slice::from_raw_parts_mut(
        RUST_HEAP_ADDRESS as usize as *mut u8,
        RUST_HEAP_BLOCKS * HEAP_BLOCK_SIZE,
    );
    let table = &mut *ptr::addr_of_mut!(RUST_HEAP_TABLE);
    let heap = BlockHeap::new(PhysAddr(RUST_HEAP_ADDRESS), storage, &mut table[..])
        .map_err(|_| KernelError::OutOfMemory)?;
    *ALLOCATOR.0.lock() = Some(heap);
    Ok(())
}

/// # Safety
/// init_rust_heap() と同じ。
unsafe fn kernel_heap() -> Result<BootHeap, KernelError> {
    let storage = core::slice::from_raw_parts_mut(
        KERNEL_HEAP_ADDRESS as usize as *mut u8,
        KERNEL_HEAP_SIZE_BYTES as usize,
    );
    let table = core::slice::from_raw_parts_mut(
        KERNEL_HEAP_TABLE_ADDRESS as usize as *mut u8,
        KERNEL_HEAP_SIZE_BYTES as usize / HEAP_BLOCK_SIZE,
    );
    BlockHeap::new(PhysAddr(KERNEL_HEAP_ADDRESS), storage, table)
        .map_err(|_| KernelError::OutOfMemory)
}

/// main から呼ばれる。戻らない。
pub fn start(files: StaticFileStore<'static>, first_program: &str) -> ! {
    cpu::disable_interrupts();
    logging::init();
    logging::info("kernel::start()");

    // Safety: ブート直後、ページング前の恒等アクセスで 1 回だけ
    let heap = unsafe { init_rust_heap().and_then(|_| kernel_heap()) };
    let heap = match heap {
        Ok(h) => h,
        Err(_) => {
            logging::error("kernel heap initialisation failed");
            cpu::halt_loop()
        }
    };

    let mut kstate: BootKernel =
        match KernelState::new(heap, files, GoblinElfParser::new(), X86Runtime::new()) {
            Ok(k) => k,
            Err(_) => {
                logging::error("kernel address space creation failed");
                cpu::halt_loop()
            }
        };

    // Safety: カーネル空間は全域恒等マップ
    unsafe { paging::enable_paging() };

    // Safety: kstate はこの関数のスタックにあり、この関数は戻らない
    unsafe { state_ref::register_kernel_state(&mut kstate) };

    if let Err(e) = kstate.process_load_switch(first_program) {
        logging::error(e.as_str());
        kstate.fatal("failed to load the first program");
    }

    kstate.run_first_ever_task()
}

/// int 0x80 スタブから呼ばれる（eax = command, フレームは pushad 済み）
#[no_mangle]
pub extern "C" fn isr80h_entry(command: u32, frame: *const InterruptFrame) -> u32 {
    // Safety: スタブはスタック上のフレームを渡す
    let Some(frame) = (unsafe { frame.as_ref() }) else {
        return KernelError::InvalidArgument.status() as u32;
    };
    state_ref::with_kernel_state(|ks: &mut BootKernel| ks.isr80h_handler(command, frame))
        .unwrap_or(KernelError::NotFound.status() as u32)
}

/// キーボード割り込みから呼ばれる（変換済みの ASCII）
#[no_mangle]
pub extern "C" fn keyboard_entry(c: u8) {
    let handled = state_ref::with_kernel_state(|ks: &mut BootKernel| {
        ks.kernel_page();
        if c == 0x08 {
            ks.keyboard_backspace();
        } else {
            ks.keyboard_push(c);
        }
        if ks.task_page().is_err() {
            logging::warn("keyboard: no current task to return to");
        }
    });
    if handled.is_none() {
        logging::warn("keyboard: kernel state not registered");
    }
}
