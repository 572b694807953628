// kernel/src/kernel/trace.rs
//
// ページングとプロセス操作の trace フック。
// - trace_paging: map / アドレス空間の生成・破棄
// - trace_process: ロード・切替・終了・malloc/free
//
// feature が off のときは引数を捨てるだけ。呼び出し側に cfg は書かない。
// 出力は logging::info / info_u64 / info_hex のみ。

use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::paging::PageFlags;

#[derive(Clone, Copy)]
pub enum ProcessTraceEvent {
    Loaded,
    Switched,
    Terminated,
    Malloc,
    Free,
}

#[inline(always)]
pub fn trace_map(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
    #[cfg(feature = "trace_paging")]
    {
        crate::logging::info("paging_trace kind=map");
        crate::logging::info_hex(" virt", virt.0 as u64);
        crate::logging::info_hex(" phys", phys.0 as u64);
        crate::logging::info_hex(" flags", flags.bits() as u64);
    }
    #[cfg(not(feature = "trace_paging"))]
    {
        let _ = virt;
        let _ = phys;
        let _ = flags;
    }
}

#[inline(always)]
pub fn trace_address_space_created(directory: PhysAddr) {
    #[cfg(feature = "trace_paging")]
    {
        crate::logging::info("paging_trace kind=create");
        crate::logging::info_hex(" directory", directory.0 as u64);
    }
    #[cfg(not(feature = "trace_paging"))]
    {
        let _ = directory;
    }
}

#[inline(always)]
pub fn trace_address_space_destroyed(directory: PhysAddr) {
    #[cfg(feature = "trace_paging")]
    {
        crate::logging::info("paging_trace kind=destroy");
        crate::logging::info_hex(" directory", directory.0 as u64);
    }
    #[cfg(not(feature = "trace_paging"))]
    {
        let _ = directory;
    }
}

#[inline(always)]
pub fn trace_process(ev: ProcessTraceEvent, pid: usize) {
    #[cfg(feature = "trace_process")]
    {
        match ev {
            ProcessTraceEvent::Loaded => crate::logging::info("process_trace kind=loaded"),
            ProcessTraceEvent::Switched => crate::logging::info("process_trace kind=switched"),
            ProcessTraceEvent::Terminated => crate::logging::info("process_trace kind=terminated"),
            ProcessTraceEvent::Malloc => crate::logging::info("process_trace kind=malloc"),
            ProcessTraceEvent::Free => crate::logging::info("process_trace kind=free"),
        }
        crate::logging::info_u64(" pid", pid as u64);
    }
    #[cfg(not(feature = "trace_process"))]
    {
        let _ = ev;
        let _ = pid;
    }
}
