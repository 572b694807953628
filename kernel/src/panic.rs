// kernel/src/panic.rs
//
// ベアメタル用 panic ハンドラ。
// 割り込みを止め、QEMU debugcon (0xE9) に発生場所だけを出して停止する。
// logging はロックを取るので使わない（ロック保持中の panic で止まってしまう）。

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use proc_kernel::arch::cpu;

const DEBUGCON: u16 = 0xE9;

static PANICKING: AtomicBool = AtomicBool::new(false);

fn debugcon(bytes: &[u8]) {
    for &b in bytes {
        // Safety: 0xE9 への出力は QEMU のデバッグポートで副作用がない
        unsafe { cpu::outb(DEBUGCON, b) };
    }
}

fn debugcon_decimal(mut v: u32) {
    let mut buf = [0u8; 10];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    debugcon(&buf[i..]);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cpu::disable_interrupts();

    // 二重 panic では何も出さない
    if !PANICKING.swap(true, Ordering::AcqRel) {
        debugcon(b"[PANIC] ");
        match info.location() {
            Some(loc) => {
                debugcon(loc.file().as_bytes());
                debugcon(b":");
                debugcon_decimal(loc.line());
            }
            None => debugcon(b"<unknown location>"),
        }
        debugcon(b"\n");
    }

    cpu::halt_loop()
}
