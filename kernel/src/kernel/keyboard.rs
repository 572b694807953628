// src/kernel/keyboard.rs
//
// プロセスごとのキーボード入力バッファ（リング）。
// - ドライバは「カレントプロセス」に push する。
// - ユーザ側の読み出し（GetKey）は「カレントタスクの持ち主」から pop する。
// - 0 は「空」を表すので格納しない。

use crate::arch::PrivilegeRuntime;
use crate::fs::FileStore;
use crate::loader::elf::ElfParser;
use crate::mm::KernelHeap;

use super::KernelState;

pub const KEYBOARD_BUFFER_SIZE: usize = 1024;

pub struct KeyboardBuffer {
    buffer: [u8; KEYBOARD_BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl Default for KeyboardBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardBuffer {
    pub const fn new() -> Self {
        KeyboardBuffer {
            buffer: [0; KEYBOARD_BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    /// 満杯なら一番古い文字を上書きする。
    pub fn push(&mut self, c: u8) {
        if c == 0 {
            return;
        }
        if self.tail.wrapping_sub(self.head) == KEYBOARD_BUFFER_SIZE {
            self.head = self.head.wrapping_add(1);
        }
        self.buffer[self.tail % KEYBOARD_BUFFER_SIZE] = c;
        self.tail = self.tail.wrapping_add(1);
    }

    /// 最後に push した文字を取り消す。
    pub fn backspace(&mut self) {
        if self.tail == self.head {
            return;
        }
        self.tail = self.tail.wrapping_sub(1);
        self.buffer[self.tail % KEYBOARD_BUFFER_SIZE] = 0;
    }

    /// 先頭の文字を取り出す。空なら 0。
    pub fn pop(&mut self) -> u8 {
        let idx = self.head % KEYBOARD_BUFFER_SIZE;
        let c = self.buffer[idx];
        if c == 0 {
            return 0;
        }
        self.buffer[idx] = 0;
        self.head = self.head.wrapping_add(1);
        c
    }
}

impl<H, F, P, R> KernelState<H, F, P, R>
where
    H: KernelHeap,
    F: FileStore,
    P: ElfParser,
    R: PrivilegeRuntime,
{
    /// キーボードドライバから呼ばれる。カレントプロセスがなければ捨てる。
    pub fn keyboard_push(&mut self, c: u8) {
        let Some(pid) = self.current_process else { return };
        if let Some(p) = self.processes[pid.0].as_deref_mut() {
            p.keyboard_mut().push(c);
        }
    }

    pub fn keyboard_backspace(&mut self) {
        let Some(pid) = self.current_process else { return };
        if let Some(p) = self.processes[pid.0].as_deref_mut() {
            p.keyboard_mut().backspace();
        }
    }

    /// カレントタスクの持ち主のバッファから 1 文字読む。
    pub fn keyboard_pop(&mut self) -> u8 {
        let owner = self
            .tasks
            .current()
            .and_then(|t| self.tasks.get(t))
            .map(|t| t.process());
        match owner.and_then(|pid| self.processes.get_mut(pid.0)?.as_deref_mut()) {
            Some(p) => p.keyboard_mut().pop(),
            None => 0,
        }
    }
}
