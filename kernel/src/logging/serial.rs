// kernel/src/logging/serial.rs
//
// 16550 UART（COM1）へのログ出力。QEMU の -serial stdio で拾う。
// init() 前の書き込みは捨てる。

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::cpu::{inb, outb};

struct Uart {
    base: u16,
}

impl Uart {
    const DATA: u16 = 0;
    const INT_ENABLE: u16 = 1;
    const FIFO_CTRL: u16 = 2;
    const LINE_CTRL: u16 = 3;
    const MODEM_CTRL: u16 = 4;
    const LINE_STATUS: u16 = 5;

    const DLAB: u8 = 0x80;
    const TX_EMPTY: u8 = 0x20;

    /// 115200bps, 8N1, FIFO 有効
    unsafe fn configure(&self) {
        outb(self.base + Self::INT_ENABLE, 0x00);
        outb(self.base + Self::LINE_CTRL, Self::DLAB);
        outb(self.base + Self::DATA, 0x01); // divisor (lo)
        outb(self.base + Self::INT_ENABLE, 0x00); // divisor (hi)
        outb(self.base + Self::LINE_CTRL, 0x03);
        outb(self.base + Self::FIFO_CTRL, 0xC7);
        outb(self.base + Self::MODEM_CTRL, 0x0B);
    }

    unsafe fn send(&self, byte: u8) {
        while inb(self.base + Self::LINE_STATUS) & Self::TX_EMPTY == 0 {
            core::hint::spin_loop();
        }
        outb(self.base + Self::DATA, byte);
    }
}

const COM1: Uart = Uart { base: 0x3F8 };

static READY: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if READY.swap(true, Ordering::AcqRel) {
        return;
    }
    // Safety: COM1 のポートはこのモジュールだけが触る
    unsafe { COM1.configure() };
}

pub fn write_str(s: &str) {
    if !READY.load(Ordering::Acquire) {
        return;
    }
    for b in s.bytes() {
        // Safety: 同上
        unsafe { COM1.send(b) };
    }
}

pub fn write_line(s: &str) {
    write_str(s);
    write_str("\r\n");
}
