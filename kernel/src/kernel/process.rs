// src/kernel/process.rs
//
// プロセス: ロードされたプログラム 1 つ分の資源の持ち主。
// - イメージ（種類つき）、ユーザスタック、タスク、malloc の記録、引数、キーボード入力。
// - ロードは「空きスロット → イメージ → スタック → タスク → マッピング → 登録」の順。
//   途中で失敗したら逆順に戻すので、作りかけのプロセスがスロットに残ることはない。
// - 終了は「malloc 分 → イメージ → スタック → タスク（アドレス空間）→ スロット」の順。

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::PrivilegeRuntime;
use crate::error::KernelError;
use crate::fs::FileStore;
use crate::loader::{self, Image, ImageDescriptor, ImageKind, Segment};
use crate::loader::elf::ElfParser;
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::layout::{USER_PROGRAM_STACK_SIZE, USER_STACK_END};
use crate::mem::paging::PageFlags;
use crate::mm::KernelHeap;

use super::keyboard::KeyboardBuffer;
use super::trace::{self, ProcessTraceEvent};
use super::{KernelState, LogEvent, TaskId, MAX_PATH, MAX_PROCESSES, MAX_PROGRAM_ALLOCATIONS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(pub usize);

/// ユーザプログラムの malloc 1 回分（物理 = 仮想で恒等マップされる）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: PhysAddr,
    pub size: usize,
}

impl Allocation {
    fn end(&self) -> Option<PhysAddr> {
        let span = (self.size.max(1) as u32).checked_next_multiple_of(PAGE_SIZE)?;
        self.ptr.offset(span)
    }
}

/// 固定長の malloc 記録表
pub struct AllocationTable {
    slots: [Option<Allocation>; MAX_PROGRAM_ALLOCATIONS],
}

impl AllocationTable {
    fn new() -> Self {
        AllocationTable {
            slots: [None; MAX_PROGRAM_ALLOCATIONS],
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn find(&self, ptr: PhysAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.map_or(false, |a| a.ptr == ptr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> + '_ {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_slot().is_none()
    }
}

/// main(argc, argv) に渡す引数（argv はユーザ空間のポインタ配列）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Arguments {
    pub argc: u32,
    pub argv: VirtAddr,
}

pub struct Process<E> {
    id: ProcessId,
    path: String,
    task: TaskId,
    image: Image<E>,
    stack: PhysAddr,
    allocations: AllocationTable,
    arguments: Arguments,
    keyboard: KeyboardBuffer,
}

impl<E> Process<E> {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn image(&self) -> &Image<E> {
        &self.image
    }

    pub fn image_kind(&self) -> ImageKind {
        self.image.kind()
    }

    pub fn stack(&self) -> PhysAddr {
        self.stack
    }

    pub fn allocations(&self) -> &AllocationTable {
        &self.allocations
    }

    pub fn arguments(&self) -> Arguments {
        self.arguments
    }

    pub(super) fn keyboard_mut(&mut self) -> &mut KeyboardBuffer {
        &mut self.keyboard
    }
}

impl<H, F, P, R> KernelState<H, F, P, R>
where
    H: KernelHeap,
    F: FileStore,
    P: ElfParser,
    R: PrivilegeRuntime,
{
    pub fn process_get(&self, pid: ProcessId) -> Option<&Process<P::Handle>> {
        self.processes.get(pid.0)?.as_deref()
    }

    fn process_get_mut(&mut self, pid: ProcessId) -> Option<&mut Process<P::Handle>> {
        self.processes.get_mut(pid.0)?.as_deref_mut()
    }

    pub fn process_current(&self) -> Option<ProcessId> {
        self.current_process
    }

    pub fn process_count(&self) -> usize {
        self.processes.iter().filter(|p| p.is_some()).count()
    }

    pub fn process_arguments(&self, pid: ProcessId) -> Option<Arguments> {
        self.process_get(pid).map(|p| p.arguments)
    }

    fn free_process_slot(&self) -> Option<ProcessId> {
        self.processes.iter().position(|p| p.is_none()).map(ProcessId)
    }

    /// 空きスロットにプログラムをロードする（まだカレントにはしない）。
    pub fn process_load(&mut self, path: &str) -> Result<ProcessId, KernelError> {
        self.process_load_as(path, None)
    }

    /// 種類を指定してロードする。None なら ELF を先に試す。
    pub fn process_load_as(
        &mut self,
        path: &str,
        kind: Option<ImageKind>,
    ) -> Result<ProcessId, KernelError> {
        let pid = self
            .free_process_slot()
            .ok_or(KernelError::ResourceExhausted)?;
        self.process_load_for_slot(path, kind, pid)
    }

    /// ロードしてカレントにする。
    pub fn process_load_switch(&mut self, path: &str) -> Result<ProcessId, KernelError> {
        let pid = self.process_load(path)?;
        self.process_switch(pid)?;
        Ok(pid)
    }

    pub fn process_switch(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        if self.process_get(pid).is_none() {
            return Err(KernelError::NotFound);
        }
        self.current_process = Some(pid);
        self.push_event(LogEvent::ProcessSwitched(pid));
        trace::trace_process(ProcessTraceEvent::Switched, pid.0);
        Ok(())
    }

    pub fn process_load_for_slot(
        &mut self,
        path: &str,
        kind: Option<ImageKind>,
        pid: ProcessId,
    ) -> Result<ProcessId, KernelError> {
        if path.is_empty() || path.len() > MAX_PATH || pid.0 >= MAX_PROCESSES {
            return Err(KernelError::InvalidArgument);
        }
        if self.processes[pid.0].is_some() {
            return Err(KernelError::ResourceExhausted);
        }

        logging::info("process_load()");
        logging::info(path);

        let image = loader::load(&mut self.heap, &mut self.files, &mut self.elf, kind, path)?;

        let descriptor = match image.descriptor(&self.elf) {
            Ok(d) => d,
            Err(e) => {
                image.release(&mut self.heap, &mut self.elf);
                return Err(e);
            }
        };

        let Some(stack) = self.heap.alloc_zeroed(USER_PROGRAM_STACK_SIZE as usize) else {
            image.release(&mut self.heap, &mut self.elf);
            return Err(KernelError::OutOfMemory);
        };

        let task = match self.tasks.create(&mut self.heap, pid, descriptor.entry) {
            Ok(t) => t,
            Err(e) => {
                self.heap.free(stack);
                image.release(&mut self.heap, &mut self.elf);
                return Err(e);
            }
        };

        if let Err(e) = self.map_process_memory(task, &descriptor, stack) {
            // テーブルはタスクの空間ごと消える
            if self.tasks.free(&mut self.heap, task).is_err() {
                logging::error("process_load: task vanished during unwind");
            }
            self.heap.free(stack);
            image.release(&mut self.heap, &mut self.elf);
            return Err(e);
        }

        self.processes[pid.0] = Some(Box::new(Process {
            id: pid,
            path: String::from(path),
            task,
            image,
            stack,
            allocations: AllocationTable::new(),
            arguments: Arguments::default(),
            keyboard: KeyboardBuffer::new(),
        }));

        self.push_event(LogEvent::TaskCreated(task));
        self.push_event(LogEvent::ProcessLoaded(pid));
        trace::trace_process(ProcessTraceEvent::Loaded, pid.0);
        logging::info_u64(" pid", pid.0 as u64);
        logging::info_hex(" entry", descriptor.entry.0 as u64);

        Ok(pid)
    }

    fn map_process_memory(
        &mut self,
        task: TaskId,
        descriptor: &ImageDescriptor,
        stack: PhysAddr,
    ) -> Result<(), KernelError> {
        let space = self
            .tasks
            .address_space_mut(task)
            .ok_or(KernelError::NotFound)?;

        // 読み取り専用と書き込み可能のセグメントが同じページに載るときは W を残す
        let (read_only, writable): (Vec<&Segment>, Vec<&Segment>) =
            descriptor.segments.iter().partition(|seg| !seg.writable);
        for seg in read_only.into_iter().chain(writable) {
            let phys_end = seg
                .phys
                .offset(seg.len as u32)
                .and_then(PhysAddr::align_up)
                .ok_or(KernelError::InvalidArgument)?;
            space.map_region(
                &mut self.heap,
                seg.virt.align_down(),
                seg.phys.align_down(),
                phys_end,
                seg.flags(),
            )?;
        }

        let stack_end = stack
            .offset(USER_PROGRAM_STACK_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        space.map_region(
            &mut self.heap,
            VirtAddr(USER_STACK_END),
            stack,
            stack_end,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        )?;
        Ok(())
    }

    /// プロセスのためにメモリを確保し、同じ仮想アドレスに P|W|U でマップする。
    pub fn process_malloc(&mut self, pid: ProcessId, size: usize) -> Result<VirtAddr, KernelError> {
        let process = self.process_get(pid).ok_or(KernelError::NotFound)?;
        if process.allocations.is_full() {
            return Err(KernelError::OutOfMemory);
        }
        let task = process.task;

        let ptr = self.heap.alloc_zeroed(size).ok_or(KernelError::OutOfMemory)?;
        let allocation = Allocation { ptr, size };

        let index = self
            .process_get(pid)
            .and_then(|p| p.allocations.free_slot());
        let Some(index) = index else {
            self.heap.free(ptr);
            return Err(KernelError::OutOfMemory);
        };

        let mapped = match (self.tasks.address_space_mut(task), allocation.end()) {
            (Some(space), Some(end)) => space
                .map_region(
                    &mut self.heap,
                    VirtAddr(ptr.0),
                    ptr,
                    end,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                )
                .is_ok(),
            _ => false,
        };
        if !mapped {
            self.heap.free(ptr);
            return Err(KernelError::OutOfMemory);
        }

        if let Some(p) = self.process_get_mut(pid) {
            p.allocations.slots[index] = Some(allocation);
        }

        let virt = VirtAddr(ptr.0);
        self.push_event(LogEvent::MemoryAllocated {
            process: pid,
            ptr: virt,
            size,
        });
        trace::trace_process(ProcessTraceEvent::Malloc, pid.0);
        Ok(virt)
    }

    /// process_malloc で確保したメモリを返す。
    /// 記録にないポインタは UnknownResource（状態は変えない）。
    pub fn process_free(&mut self, pid: ProcessId, ptr: VirtAddr) -> Result<(), KernelError> {
        let process = self.process_get(pid).ok_or(KernelError::NotFound)?;
        let task = process.task;
        let index = process
            .allocations
            .find(PhysAddr(ptr.0))
            .ok_or(KernelError::UnknownResource)?;
        let Some(allocation) = process.allocations.slots[index] else {
            return Err(KernelError::UnknownResource);
        };

        // ユーザ側から見えなくする
        let end = allocation.end().ok_or(KernelError::InvalidArgument)?;
        let space = self
            .tasks
            .address_space_mut(task)
            .ok_or(KernelError::NotFound)?;
        space.map_region(&mut self.heap, ptr, allocation.ptr, end, PageFlags::empty())?;

        if let Some(p) = self.process_get_mut(pid) {
            p.allocations.slots[index] = None;
        }
        self.heap.free(allocation.ptr);

        self.push_event(LogEvent::MemoryFreed { process: pid, ptr });
        trace::trace_process(ProcessTraceEvent::Free, pid.0);
        Ok(())
    }

    /// argv 配列と各引数文字列をプロセスのメモリに置く。
    pub fn process_inject_arguments(&mut self, pid: ProcessId, args: &[&str]) -> Result<(), KernelError> {
        if args.is_empty() {
            return Err(KernelError::Io);
        }
        if self.process_get(pid).is_none() {
            return Err(KernelError::NotFound);
        }

        let mut owned: Vec<VirtAddr> = Vec::with_capacity(args.len() + 1);
        let result = self.build_arguments(pid, args, &mut owned);
        match result {
            Ok(arguments) => {
                if let Some(p) = self.process_get_mut(pid) {
                    p.arguments = arguments;
                }
                Ok(())
            }
            Err(e) => {
                for ptr in owned.into_iter().rev() {
                    if self.process_free(pid, ptr).is_err() {
                        logging::warn("process_inject_arguments: failed to release argument memory");
                        logging::info_hex(" ptr", ptr.0 as u64);
                    }
                }
                Err(e)
            }
        }
    }

    fn build_arguments(
        &mut self,
        pid: ProcessId,
        args: &[&str],
        owned: &mut Vec<VirtAddr>,
    ) -> Result<Arguments, KernelError> {
        let argv = self.process_malloc(pid, args.len() * 4)?;
        owned.push(argv);

        for (i, arg) in args.iter().enumerate() {
            let buf = self.process_malloc(pid, arg.len() + 1)?;
            owned.push(buf);

            // malloc の領域は恒等マップなので物理アドレスで直接書ける
            let dst = self
                .heap
                .bytes_mut(PhysAddr(buf.0), arg.len() + 1)
                .ok_or(KernelError::OutOfMemory)?;
            dst[..arg.len()].copy_from_slice(arg.as_bytes());
            dst[arg.len()] = 0;

            self.heap
                .write_u32(PhysAddr(argv.0 + i as u32 * 4), buf.0)
                .ok_or(KernelError::OutOfMemory)?;
        }

        Ok(Arguments {
            argc: args.len() as u32,
            argv,
        })
    }

    /// プロセスを終了して全資源を返す。
    ///
    /// カレントだった場合は、リングのカレントタスクの持ち主（いなければ任意の生存プロセス）に切り替える。
    /// 生存プロセスがなくなったら NoProcessLeft（呼び出し側はシステムを止める）。
    pub fn process_terminate(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        let process = self
            .processes
            .get_mut(pid.0)
            .and_then(Option::take)
            .ok_or(KernelError::NotFound)?;

        logging::info("process_terminate()");
        logging::info_u64(" pid", pid.0 as u64);

        let Process {
            task,
            image,
            stack,
            allocations,
            ..
        } = *process;

        // 1. malloc 分（テーブルはこのあと空間ごと消えるので unmap はしない）
        for a in allocations.iter() {
            self.heap.free(a.ptr);
        }

        // 2. イメージ
        image.release(&mut self.heap, &mut self.elf);

        // 3. スタック
        self.heap.free(stack);

        // 4. タスク（アドレス空間ごと）
        if self.tasks.free(&mut self.heap, task).is_err() {
            logging::error("process_terminate: task already gone");
        }
        self.push_event(LogEvent::TaskFreed(task));
        self.push_event(LogEvent::ProcessTerminated(pid));
        trace::trace_process(ProcessTraceEvent::Terminated, pid.0);

        // 5. カレントの付け替え
        let was_current = self.current_process == Some(pid);
        if was_current {
            self.current_process = None;
        }
        if was_current || self.process_count() == 0 {
            let next = self
                .tasks
                .current()
                .and_then(|t| self.tasks.get(t))
                .map(|t| t.process())
                .filter(|&p| self.process_get(p).is_some())
                .or_else(|| self.processes.iter().flatten().map(|p| p.id).next());

            match next {
                Some(next) => self.process_switch(next)?,
                None => return Err(KernelError::NoProcessLeft),
            }
        }

        Ok(())
    }
}
