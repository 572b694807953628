// kernel/src/arch/ring3.rs
//
// 役割:
// - ring0 から ring3 へ入る最小 glue（iretd）を提供する。
// - unsafe asm はここに閉じ込め、上位は「保存レジスタを渡すだけ」にする。
//
// やること:
// - Registers から iretd フレーム（ss, esp, eflags, cs, eip）を積む
// - データセグメントを ss に揃え、汎用レジスタを復元して iretd
//
// オフセットは arch::Registers の並びに固定で依存する:
//   edi 0, esi 4, ebp 8, ebx 12, edx 16, ecx 20, eax 24,
//   ip 28, cs 32, flags 36, esp 40, ss 44

use super::Registers;

/// ring3 へ遷移する（戻らない）。
///
/// # Safety
/// - 現在の CR3 が regs の持ち主のアドレス空間であること。
/// - regs.cs / regs.ss が GDT 上の ring3 セレクタであること。
pub unsafe fn enter_user_mode_iretd(regs: &Registers) -> ! {
    core::arch::asm!(
        // iretd フレーム: SS, ESP, EFLAGS, CS, EIP
        "push dword ptr [eax + 44]",
        "push dword ptr [eax + 40]",
        "mov ebx, [eax + 36]",
        "or ebx, 0x200",
        "push ebx",
        "push dword ptr [eax + 32]",
        "push dword ptr [eax + 28]",
        // データセグメント
        "mov ebx, [eax + 44]",
        "mov ds, bx",
        "mov es, bx",
        "mov fs, bx",
        "mov gs, bx",
        // 汎用レジスタ（eax は最後）
        "mov edi, [eax + 0]",
        "mov esi, [eax + 4]",
        "mov ebp, [eax + 8]",
        "mov ebx, [eax + 12]",
        "mov edx, [eax + 16]",
        "mov ecx, [eax + 20]",
        "mov eax, [eax + 24]",
        "iretd",
        in("eax") regs as *const Registers,
        options(noreturn)
    );
}
