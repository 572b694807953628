// src/arch/cpu.rs
// CPU 命令ラッパ（i686）。unsafe は最小限。

use core::arch::asm;

pub fn halt_loop() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// # Safety
/// port が存在するデバイスのものであること。
pub unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    value
}

/// # Safety
/// port が存在するデバイスのものであること。
pub unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

/// # Safety
/// 実行中のコード・スタックが新しいディレクトリでもマップされていること。
pub unsafe fn write_cr3(directory: u32) {
    asm!("mov cr3, {}", in(reg) directory, options(nostack, preserves_flags));
}

pub fn read_cr0() -> u32 {
    let value: u32;
    unsafe {
        asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// # Safety
/// CR0 のビットの意味を理解した上で呼ぶこと。
pub unsafe fn write_cr0(value: u32) {
    asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
}
