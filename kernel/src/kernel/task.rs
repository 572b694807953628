// src/kernel/task.rs
//
// タスク: 実行の単位。プロセスと 1:1。
// - 自分のアドレス空間を所有する（タスクが消えるとき一緒に消える）。
// - 保存レジスタを持ち、ring3 へ戻るときはそれをそのまま復元する。
// - リングは Vec のスロット + index のリンク（next/prev）で表す。
//   ポインタの相互参照は持たない。
//
// 状態遷移:
//   Created → Current ↔ NotCurrent → (free)

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{InterruptFrame, PrivilegeRuntime, Registers};
use crate::error::KernelError;
use crate::fs::FileStore;
use crate::loader::elf::ElfParser;
use crate::logging;
use crate::mem::address_space::AddressSpace;
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::layout::{USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_STACK_START};
use crate::mem::paging::PageFlags;
use crate::mm::KernelHeap;

use super::{KernelState, LogEvent, ProcessId};

/// bit1（予約、常に 1）+ IF
pub const USER_INITIAL_FLAGS: u32 = 0x202;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Current,
    NotCurrent,
}

#[derive(Debug)]
pub struct Task {
    space: AddressSpace,
    registers: Registers,
    process: ProcessId,
    state: TaskState,
    next: Option<TaskId>,
    prev: Option<TaskId>,
}

impl Task {
    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn state(&self) -> TaskState {
        self.state
    }
}

pub struct TaskRing {
    slots: Vec<Option<Task>>,
    head: Option<TaskId>,
    tail: Option<TaskId>,
    current: Option<TaskId>,
    len: usize,
}

impl Default for TaskRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRing {
    pub const fn new() -> Self {
        TaskRing {
            slots: Vec::new(),
            head: None,
            tail: None,
            current: None,
            len: 0,
        }
    }

    /// 新しいタスクを末尾に足す。リングが空だったらそれがカレントになる。
    pub fn create<H: KernelHeap + ?Sized>(
        &mut self,
        heap: &mut H,
        process: ProcessId,
        entry: VirtAddr,
    ) -> Result<TaskId, KernelError> {
        let space = AddressSpace::create(heap, PageFlags::PRESENT | PageFlags::USER)?;

        let registers = Registers {
            ip: entry.0,
            cs: USER_CODE_SELECTOR,
            flags: USER_INITIAL_FLAGS,
            esp: USER_STACK_START,
            ss: USER_DATA_SELECTOR,
            ..Registers::default()
        };

        let mut task = Task {
            space,
            registers,
            process,
            state: TaskState::Created,
            next: None,
            prev: self.tail,
        };

        let id = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => TaskId(i),
            None => {
                self.slots.push(None);
                TaskId(self.slots.len() - 1)
            }
        };

        if self.current.is_none() {
            task.state = TaskState::Current;
            self.current = Some(id);
        }
        self.slots[id.0] = Some(task);

        match self.tail {
            Some(t) => {
                if let Some(tail) = self.slot_mut(t) {
                    tail.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;

        Ok(id)
    }

    /// リングから外してアドレス空間ごと解放する。
    /// カレントだった場合は後続（なければ先頭）がカレントになる。
    pub fn free<H: KernelHeap + ?Sized>(&mut self, heap: &mut H, id: TaskId) -> Result<(), KernelError> {
        let (prev, next) = {
            let t = self.get(id).ok_or(KernelError::NotFound)?;
            (t.prev, t.next)
        };

        // 後継はリンクを切る前に決める
        let successor = self.next_of(id).filter(|&s| s != id);

        match prev {
            Some(p) => {
                if let Some(t) = self.slot_mut(p) {
                    t.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(t) = self.slot_mut(n) {
                    t.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if self.current == Some(id) {
            self.current = successor;
            if let Some(s) = successor.and_then(|s| self.slot_mut(s)) {
                s.state = TaskState::Current;
            }
        }

        if let Some(task) = self.slots[id.0].take() {
            task.space.destroy(heap);
        }
        self.len -= 1;
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn head(&self) -> Option<TaskId> {
        self.head
    }

    pub fn tail(&self) -> Option<TaskId> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 次のタスク。末尾の次は先頭。
    pub fn next_of(&self, id: TaskId) -> Option<TaskId> {
        self.get(id)?.next.or(self.head)
    }

    pub fn set_current(&mut self, id: TaskId) -> Result<(), KernelError> {
        if self.get(id).is_none() {
            return Err(KernelError::NotFound);
        }
        if let Some(old) = self.current.filter(|&c| c != id) {
            if let Some(t) = self.slot_mut(old) {
                t.state = TaskState::NotCurrent;
            }
        }
        if let Some(t) = self.slot_mut(id) {
            t.state = TaskState::Current;
        }
        self.current = Some(id);
        Ok(())
    }

    /// head から順に
    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &Task)> + '_ {
        let mut cursor = self.head;
        let mut remaining = self.len;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let id = cursor?;
            let task = self.get(id)?;
            cursor = task.next;
            remaining -= 1;
            Some((id, task))
        })
    }

    pub(crate) fn links_consistent(&self) -> bool {
        let mut count = 0;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(t) = self.get(id) else { return false };
            if t.prev != prev || count > self.len {
                return false;
            }
            count += 1;
            prev = Some(id);
            cursor = t.next;
        }
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        count == self.len && live == self.len && prev == self.tail
    }

    pub(crate) fn address_space_mut(&mut self, id: TaskId) -> Option<&mut AddressSpace> {
        self.slot_mut(id).map(|t| &mut t.space)
    }

    fn registers_mut(&mut self, id: TaskId) -> Option<&mut Registers> {
        self.slot_mut(id).map(|t| &mut t.registers)
    }
}

impl<H, F, P, R> KernelState<H, F, P, R>
where
    H: KernelHeap,
    F: FileStore,
    P: ElfParser,
    R: PrivilegeRuntime,
{
    /// id をカレントにして、そのアドレス空間を読み込む。
    pub fn task_switch(&mut self, id: TaskId) -> Result<(), KernelError> {
        self.tasks.set_current(id)?;
        if let Some(t) = self.tasks.get(id) {
            t.address_space().switch_in(&mut self.runtime);
        }
        self.push_event(LogEvent::TaskSwitched(id));
        Ok(())
    }

    /// カレントタスクの空間に戻る（割り込み出口で呼ぶ）
    pub fn task_page(&mut self) -> Result<(), KernelError> {
        let id = self.tasks.current().ok_or(KernelError::NotFound)?;
        self.task_switch(id)
    }

    /// 割り込まれたレジスタをカレントタスクに保存する。
    pub fn task_current_save_state(&mut self, frame: &InterruptFrame) -> Result<(), KernelError> {
        let id = self.tasks.current().ok_or(KernelError::NotFound)?;
        let saved = self.runtime.save_interrupted_registers(frame);
        let regs = self.tasks.registers_mut(id).ok_or(KernelError::NotFound)?;
        *regs = saved;
        Ok(())
    }

    /// id に切り替えて ring3 に入る。戻らない。
    pub fn task_return(&mut self, id: TaskId) -> ! {
        if self.task_switch(id).is_err() {
            self.fatal("task_return: no such task");
        }
        let regs = match self.tasks.get(id) {
            Some(t) => *t.registers(),
            None => self.fatal("task_return: no such task"),
        };
        self.runtime.enter_user_mode(&regs)
    }

    /// 起動直後、リングのカレントタスクに入る。
    pub fn run_first_ever_task(&mut self) -> ! {
        match self.tasks.current() {
            Some(id) => {
                logging::info("run_first_ever_task()");
                self.task_return(id)
            }
            None => self.fatal("run_first_ever_task: no current task exists"),
        }
    }

    /// カレントの次のタスクへ譲る。
    pub fn task_next(&mut self) -> ! {
        match self.tasks.current().and_then(|c| self.tasks.next_of(c)) {
            Some(id) => self.task_return(id),
            None => self.fatal("task_next: no more tasks"),
        }
    }

    /// ユーザスタック上の index 番目の 32bit 値（esp から上向き）
    pub fn task_get_stack_item(&self, id: TaskId, index: usize) -> Result<u32, KernelError> {
        let t = self.tasks.get(id).ok_or(KernelError::NotFound)?;
        let virt = VirtAddr(t.registers().esp)
            .offset((index as u32).checked_mul(4).ok_or(KernelError::InvalidArgument)?)
            .ok_or(KernelError::InvalidArgument)?;

        let mut raw = [0u8; 4];
        t.address_space().read_bytes(&self.heap, virt, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// タスク空間の NUL 終端文字列を最大 max バイトまで読む。
    pub fn copy_string_from_task(
        &self,
        id: TaskId,
        virt: VirtAddr,
        max: usize,
    ) -> Result<String, KernelError> {
        if max == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let t = self.tasks.get(id).ok_or(KernelError::NotFound)?;

        let mut out = Vec::new();
        let mut cursor = virt;
        while out.len() < max {
            let chunk = ((PAGE_SIZE - cursor.page_offset()) as usize).min(max - out.len());
            let start = out.len();
            out.resize(start + chunk, 0);
            t.address_space()
                .read_bytes(&self.heap, cursor, &mut out[start..])?;

            if let Some(nul) = out[start..].iter().position(|&b| b == 0) {
                out.truncate(start + nul);
                break;
            }
            cursor = match cursor.offset(chunk as u32) {
                Some(c) => c,
                None => break,
            };
        }

        String::from_utf8(out).map_err(|_| KernelError::InvalidArgument)
    }

    /// カーネルのバイト列をタスク空間に書く。
    pub fn copy_to_task(&mut self, id: TaskId, virt: VirtAddr, data: &[u8]) -> Result<(), KernelError> {
        let t = self.tasks.get(id).ok_or(KernelError::NotFound)?;
        t.address_space().write_bytes(&mut self.heap, virt, data)?;
        Ok(())
    }
}
