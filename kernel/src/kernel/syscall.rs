// kernel/src/kernel/syscall.rs
//
// int 0x80 のうち、プロセス / メモリ / 入力に関わるコマンド。
//
// 入口の段取り（isr80h_handler）:
//   1. kernel_page()            カーネル空間へ
//   2. 割り込みフレームを保存   カレントタスクへ
//   3. コマンド実行
//   4. task_page()              カレントタスクの空間へ戻る
//
// 引数はユーザスタックに積まれている（task_get_stack_item で読む）。
// 戻り値は eax に入る 32bit 値。失敗は KernelError::status() の負値。

use alloc::format;

use crate::arch::{InterruptFrame, PrivilegeRuntime};
use crate::error::KernelError;
use crate::fs::FileStore;
use crate::loader::elf::ElfParser;
use crate::logging;
use crate::mem::addr::VirtAddr;
use crate::mm::KernelHeap;

use super::{KernelState, LogEvent, ProcessId, TaskId, MAX_PATH};

/// ユーザが渡したファイル名の前に付けるドライブ
const DEFAULT_DRIVE: &str = "0:/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    GetKey = 2,
    Malloc = 4,
    Free = 5,
    ProcessLoadStart = 6,
    GetArguments = 8,
    Exit = 9,
}

impl Syscall {
    pub fn from_command(command: u32) -> Option<Syscall> {
        match command {
            2 => Some(Syscall::GetKey),
            4 => Some(Syscall::Malloc),
            5 => Some(Syscall::Free),
            6 => Some(Syscall::ProcessLoadStart),
            8 => Some(Syscall::GetArguments),
            9 => Some(Syscall::Exit),
            _ => None,
        }
    }
}

impl<H, F, P, R> KernelState<H, F, P, R>
where
    H: KernelHeap,
    F: FileStore,
    P: ElfParser,
    R: PrivilegeRuntime,
{
    pub fn isr80h_handler(&mut self, command: u32, frame: &InterruptFrame) -> u32 {
        self.kernel_page();

        let result = match self.task_current_save_state(frame) {
            Ok(()) => match Syscall::from_command(command) {
                Some(sc) => self.handle_syscall(sc),
                None => Err(KernelError::InvalidArgument),
            },
            Err(e) => Err(e),
        };
        self.push_event(LogEvent::SyscallHandled(command));

        if self.task_page().is_err() {
            logging::error("isr80h: no current task to return to");
        }

        match result {
            Ok(v) => v,
            Err(e) => e.status() as u32,
        }
    }

    fn handle_syscall(&mut self, sc: Syscall) -> Result<u32, KernelError> {
        let task = self.tasks.current().ok_or(KernelError::NotFound)?;
        let pid = self
            .tasks
            .get(task)
            .map(|t| t.process())
            .ok_or(KernelError::NotFound)?;

        match sc {
            Syscall::GetKey => Ok(self.keyboard_pop() as u32),
            Syscall::Malloc => {
                let size = self.task_get_stack_item(task, 0)? as usize;
                Ok(self.process_malloc(pid, size).map_or(0, |v| v.0))
            }
            Syscall::Free => {
                let ptr = VirtAddr(self.task_get_stack_item(task, 0)?);
                match self.process_free(pid, ptr) {
                    Ok(()) | Err(KernelError::UnknownResource) => Ok(0),
                    Err(e) => Err(e),
                }
            }
            Syscall::ProcessLoadStart => self.syscall_process_load_start(task),
            Syscall::GetArguments => {
                let out = VirtAddr(self.task_get_stack_item(task, 0)?);
                let args = self.process_arguments(pid).ok_or(KernelError::NotFound)?;

                let mut raw = [0u8; 8];
                raw[..4].copy_from_slice(&args.argc.to_le_bytes());
                raw[4..].copy_from_slice(&args.argv.0.to_le_bytes());
                self.copy_to_task(task, out, &raw)?;
                Ok(0)
            }
            Syscall::Exit => self.syscall_exit(pid),
        }
    }

    /// 成功したら新しいプロセスのタスクに入るので戻らない。
    fn syscall_process_load_start(&mut self, task: TaskId) -> Result<u32, KernelError> {
        let ptr = VirtAddr(self.task_get_stack_item(task, 0)?);
        let name = self.copy_string_from_task(task, ptr, MAX_PATH)?;
        let path = format!("{DEFAULT_DRIVE}{name}");

        let pid = self.process_load_switch(&path)?;
        let next = self
            .process_get(pid)
            .map(|p| p.task())
            .ok_or(KernelError::NotFound)?;
        self.task_return(next)
    }

    /// 呼び出し元を終了して、次のカレントタスクに入る。
    fn syscall_exit(&mut self, pid: ProcessId) -> ! {
        match self.process_terminate(pid) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.fatal("exit: no process left"),
            Err(_) => logging::error("exit: terminate failed"),
        }

        match self.tasks.current() {
            Some(next) => self.task_return(next),
            None => self.fatal("exit: no task to run"),
        }
    }
}
