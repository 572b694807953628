// kernel/src/main.rs
//
// ベアメタル（i686）起動イメージ。cargo build --no-default-features --features kmain で作る。
// ブートローダがプロテクトモード・GDT・TSS・IDT を整えてから _start に飛んでくる前提。

#![no_std]
#![no_main]

mod panic;

use proc_kernel::fs::StaticFileStore;
use proc_kernel::kernel::entry;

/// 最初に走らせるプログラム（jmp $）
static IDLE_PROGRAM: [u8; 2] = [0xEB, 0xFE];

static FILES: [(&str, &[u8]); 1] = [("0:/idle.bin", &IDLE_PROGRAM)];

#[no_mangle]
pub extern "C" fn _start() -> ! {
    entry::start(StaticFileStore::new(&FILES), "0:/idle.bin")
}
