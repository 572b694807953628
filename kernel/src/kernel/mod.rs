// src/kernel/mod.rs
//
// proc-kernel: プロセス表 + タスクリング + プロセスごとのアドレス空間
//
// - KernelState が全体の状態（ヒープ・ファイルストア・ELF パーサ・CPU 操作・
//   カーネル空間・プロセス表・タスクリング・イベントログ）を 1 つに持つ。
// - グローバル変数は state_ref の登録先だけ。各操作は &mut self で受ける。
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. プロセスとタスク
//    - 生きているプロセス p について、tasks[p.task] が存在し、その process は p.id。
//    - リング上のタスク t について、processes[t.process] が存在し、その task は t。
//
// 2. カレント
//    - リングが空でなければ、リングのカレントタスクは必ず存在する。
//    - current_process が Some なら、そのスロットは埋まっている。
//
// 3. リングのリンク
//    - head から next をたどると tail に着き、その数は len と一致する。
//
// これらは debug_check_invariants() によってログ出力ベースで検証される。

pub mod keyboard;
pub mod process;
pub mod state_ref;
pub mod syscall;
pub mod task;
pub mod trace;

#[cfg(all(target_arch = "x86", not(feature = "std")))]
pub mod entry;

use alloc::boxed::Box;

use crate::arch::PrivilegeRuntime;
use crate::error::KernelError;
use crate::fs::FileStore;
use crate::loader::elf::ElfParser;
use crate::logging;
use crate::mem::address_space::AddressSpace;
use crate::mem::addr::VirtAddr;
use crate::mem::paging::PageFlags;
use crate::mm::KernelHeap;

pub use self::process::{Allocation, Arguments, Process, ProcessId};
pub use self::task::{Task, TaskId, TaskRing, TaskState};

pub const MAX_PROCESSES: usize = 12;
pub const MAX_PROGRAM_ALLOCATIONS: usize = 1024;
pub const MAX_PATH: usize = 108;
pub const EVENT_LOG_CAP: usize = 256;

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    ProcessLoaded(ProcessId),
    ProcessSwitched(ProcessId),
    ProcessTerminated(ProcessId),
    TaskCreated(TaskId),
    TaskSwitched(TaskId),
    TaskFreed(TaskId),
    MemoryAllocated {
        process: ProcessId,
        ptr: VirtAddr,
        size: usize,
    },
    MemoryFreed {
        process: ProcessId,
        ptr: VirtAddr,
    },
    SyscallHandled(u32),
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState<H, F, P: ElfParser, R> {
    heap: H,
    files: F,
    elf: P,
    runtime: R,

    // カーネル自身の空間（全域恒等マップ、P|W|U）
    kernel_space: AddressSpace,

    // プロセス表
    processes: [Option<Box<Process<P::Handle>>>; MAX_PROCESSES],
    current_process: Option<ProcessId>,

    // タスクリング
    tasks: TaskRing,

    // 抽象イベントログ
    event_log: [Option<LogEvent>; EVENT_LOG_CAP],
    event_log_len: usize,
}

impl<H, F, P, R> KernelState<H, F, P, R>
where
    H: KernelHeap,
    F: FileStore,
    P: ElfParser,
    R: PrivilegeRuntime,
{
    /// カーネル空間を作って読み込む。プロセスはまだない。
    pub fn new(mut heap: H, files: F, elf: P, mut runtime: R) -> Result<Self, KernelError> {
        logging::info("KernelState::new()");

        let kernel_space = AddressSpace::create(
            &mut heap,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        )?;
        kernel_space.switch_in(&mut runtime);
        logging::info_hex(" kernel_directory", kernel_space.directory().0 as u64);

        Ok(KernelState {
            heap,
            files,
            elf,
            runtime,
            kernel_space,
            processes: core::array::from_fn(|_| None),
            current_process: None,
            tasks: TaskRing::new(),
            event_log: [None; EVENT_LOG_CAP],
            event_log_len: 0,
        })
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    pub fn files_mut(&mut self) -> &mut F {
        &mut self.files
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    pub fn tasks(&self) -> &TaskRing {
        &self.tasks
    }

    /// カーネル空間に戻る（割り込み入口で最初に呼ぶ）
    pub fn kernel_page(&mut self) {
        self.kernel_space.switch_in(&mut self.runtime);
    }

    /// 致命的エラー。ログを出して止まる。
    pub fn fatal(&mut self, msg: &str) -> ! {
        logging::error(msg);
        self.dump_events();
        self.runtime.halt()
    }

    fn push_event(&mut self, ev: LogEvent) {
        if self.event_log_len < EVENT_LOG_CAP {
            self.event_log[self.event_log_len] = Some(ev);
            self.event_log_len += 1;
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> + '_ {
        self.event_log[..self.event_log_len].iter().flatten()
    }

    /// 不変条件を確認し、違反の数を返す（違反は logging::error で出す）
    pub fn debug_check_invariants(&self) -> usize {
        let mut violations = 0;

        // 1. プロセス → タスク
        for (slot, entry) in self.processes.iter().enumerate() {
            let Some(p) = entry else { continue };

            if p.id() != ProcessId(slot) {
                logging::error("INVARIANT VIOLATION: process id does not match its slot");
                logging::info_u64(" slot", slot as u64);
                violations += 1;
            }

            match self.tasks.get(p.task()) {
                Some(t) if t.process() == p.id() => {}
                Some(_) => {
                    logging::error("INVARIANT VIOLATION: task belongs to another process");
                    logging::info_u64(" slot", slot as u64);
                    violations += 1;
                }
                None => {
                    logging::error("INVARIANT VIOLATION: process has no task");
                    logging::info_u64(" slot", slot as u64);
                    violations += 1;
                }
            }
        }

        // 1'. タスク → プロセス
        for (tid, t) in self.tasks.iter() {
            let owner = self.processes.get(t.process().0).and_then(|p| p.as_deref());
            if owner.map(|p| p.task()) != Some(tid) {
                logging::error("INVARIANT VIOLATION: task owner is not a live process");
                logging::info_u64(" task", tid.0 as u64);
                violations += 1;
            }
        }

        // 2. カレント
        if !self.tasks.is_empty() && self.tasks.current().is_none() {
            logging::error("INVARIANT VIOLATION: ring has tasks but no current task");
            violations += 1;
        }
        if let Some(pid) = self.current_process {
            if self.process_get(pid).is_none() {
                logging::error("INVARIANT VIOLATION: current process slot is empty");
                logging::info_u64(" pid", pid.0 as u64);
                violations += 1;
            }
        }

        // 3. リングのリンク
        if !self.tasks.links_consistent() {
            logging::error("INVARIANT VIOLATION: task ring links are inconsistent");
            violations += 1;
        }

        violations
    }

    //
    // dump_events()
    //
    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");

        for ev in self.events() {
            log_event(*ev);
        }

        logging::info("=== End of Event Log ===");

        logging::info("=== Process Dump ===");
        for p in self.processes.iter().flatten() {
            logging::info(" Process:");
            logging::info_u64("  pid", p.id().0 as u64);
            logging::info(p.path());
            logging::info_u64("  task", p.task().0 as u64);
            logging::info_u64("  allocations", p.allocations().len() as u64);
            if let Some(t) = self.tasks.get(p.task()) {
                logging::info_hex("  directory", t.address_space().directory().0 as u64);
                logging::info_hex("  ip", t.registers().ip as u64);
            }
        }
        logging::info("=== End of Process Dump ===");
    }
}

// ─────────────────────────────────────────────
// LogEvent → ログ出力
// ─────────────────────────────────────────────

fn log_event(ev: LogEvent) {
    match ev {
        LogEvent::ProcessLoaded(pid) => {
            logging::info("EVENT: ProcessLoaded");
            logging::info_u64(" pid", pid.0 as u64);
        }
        LogEvent::ProcessSwitched(pid) => {
            logging::info("EVENT: ProcessSwitched");
            logging::info_u64(" pid", pid.0 as u64);
        }
        LogEvent::ProcessTerminated(pid) => {
            logging::info("EVENT: ProcessTerminated");
            logging::info_u64(" pid", pid.0 as u64);
        }
        LogEvent::TaskCreated(tid) => {
            logging::info("EVENT: TaskCreated");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::TaskSwitched(tid) => {
            logging::info("EVENT: TaskSwitched");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::TaskFreed(tid) => {
            logging::info("EVENT: TaskFreed");
            logging::info_u64(" task", tid.0 as u64);
        }
        LogEvent::MemoryAllocated { process, ptr, size } => {
            logging::info("EVENT: MemoryAllocated");
            logging::info_u64(" pid", process.0 as u64);
            logging::info_hex(" ptr", ptr.0 as u64);
            logging::info_u64(" size", size as u64);
        }
        LogEvent::MemoryFreed { process, ptr } => {
            logging::info("EVENT: MemoryFreed");
            logging::info_u64(" pid", process.0 as u64);
            logging::info_hex(" ptr", ptr.0 as u64);
        }
        LogEvent::SyscallHandled(cmd) => {
            logging::info("EVENT: SyscallHandled");
            logging::info_u64(" command", cmd as u64);
        }
    }
}
