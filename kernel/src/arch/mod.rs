// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - cpu: hlt / port I/O / CR0・CR3 など CPU 命令ラッパ
// - paging: ページディレクトリの切替・ページング有効化
// - ring3: iretd で ring3 に入る glue
//
// 上位（kernel / mem）は PrivilegeRuntime trait しか見ない。
// ホスト上のテストではこの trait を記録用の実装（mock::RecordingRuntime）に差し替える。

#[cfg(all(target_arch = "x86", not(feature = "std")))]
pub mod cpu;
#[cfg(all(target_arch = "x86", not(feature = "std")))]
pub mod paging;
#[cfg(all(target_arch = "x86", not(feature = "std")))]
pub mod ring3;

use crate::mem::addr::PhysAddr;

/// タスクの保存レジスタ。ring3 へ戻るときにこの順で復元する（ring3.rs がオフセットに依存）。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub ip: u32,
    pub cs: u32,
    pub flags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// 割り込み入口（pushad + CPU が積む iret フレーム）の並び。
/// pushad の esp 相当（reserved）は使わない。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub reserved: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ip: u32,
    pub cs: u32,
    pub flags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl From<&InterruptFrame> for Registers {
    fn from(f: &InterruptFrame) -> Self {
        Registers {
            edi: f.edi,
            esi: f.esi,
            ebp: f.ebp,
            ebx: f.ebx,
            edx: f.edx,
            ecx: f.ecx,
            eax: f.eax,
            ip: f.ip,
            cs: f.cs,
            flags: f.flags,
            esp: f.esp,
            ss: f.ss,
        }
    }
}

/// 特権遷移まわりの CPU 操作。
pub trait PrivilegeRuntime {
    /// CR3 にページディレクトリを読み込む。
    fn load_page_directory(&mut self, directory: PhysAddr);

    /// 最後に読み込んだページディレクトリ
    fn current_directory(&self) -> Option<PhysAddr>;

    /// 保存レジスタを復元して ring3 に入る。戻らない。
    fn enter_user_mode(&mut self, regs: &Registers) -> !;

    /// 割り込まれた時点のレジスタをタスク用の形に写す。
    fn save_interrupted_registers(&self, frame: &InterruptFrame) -> Registers {
        Registers::from(frame)
    }

    /// システム停止。戻らない。
    fn halt(&mut self) -> !;
}

/// 実機（i686）用
#[cfg(all(target_arch = "x86", not(feature = "std")))]
pub struct X86Runtime {
    directory: Option<PhysAddr>,
}

#[cfg(all(target_arch = "x86", not(feature = "std")))]
impl X86Runtime {
    pub const fn new() -> Self {
        X86Runtime { directory: None }
    }
}

#[cfg(all(target_arch = "x86", not(feature = "std")))]
impl PrivilegeRuntime for X86Runtime {
    fn load_page_directory(&mut self, directory: PhysAddr) {
        // Safety: directory は AddressSpace::create が作った有効なディレクトリで、
        // カーネル領域は全空間で恒等マップされている
        unsafe { paging::switch_address_space(directory) };
        self.directory = Some(directory);
    }

    fn current_directory(&self) -> Option<PhysAddr> {
        self.directory
    }

    fn enter_user_mode(&mut self, regs: &Registers) -> ! {
        // Safety: 呼び出し側がタスクのアドレス空間に切り替え済み
        unsafe { ring3::enter_user_mode_iretd(regs) }
    }

    fn halt(&mut self) -> ! {
        cpu::halt_loop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_layout_matches_trampoline_offsets() {
        assert_eq!(core::mem::size_of::<Registers>(), 48);
        assert_eq!(core::mem::offset_of!(Registers, ip), 28);
        assert_eq!(core::mem::offset_of!(Registers, cs), 32);
        assert_eq!(core::mem::offset_of!(Registers, flags), 36);
        assert_eq!(core::mem::offset_of!(Registers, esp), 40);
        assert_eq!(core::mem::offset_of!(Registers, ss), 44);
    }

    #[test]
    fn frame_conversion_skips_reserved_slot() {
        let frame = InterruptFrame {
            edi: 1,
            esi: 2,
            ebp: 3,
            reserved: 99,
            ebx: 4,
            edx: 5,
            ecx: 6,
            eax: 7,
            ip: 8,
            cs: 9,
            flags: 10,
            esp: 11,
            ss: 12,
        };
        let r = Registers::from(&frame);
        assert_eq!(
            [r.edi, r.esi, r.ebp, r.ebx, r.edx, r.ecx, r.eax, r.ip, r.cs, r.flags, r.esp, r.ss],
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }
}
