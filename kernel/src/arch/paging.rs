// kernel/src/arch/paging.rs
//
// 役割:
// - 実 CPU のページングを操作する（CR3 / CR0.PG）。
// - ページテーブルの中身を組むのは mem::address_space。ここは「読み込ませる」だけ。

use crate::logging;
use crate::mem::addr::PhysAddr;

use super::cpu;

const CR0_PAGING: u32 = 1 << 31;

/// CR3 を切り替える。
///
/// # Safety
/// - directory は有効なページディレクトリであること。
/// - 実行中のコード・スタック・カーネルヒープが新しい空間でも同じ場所にマップされていること。
pub unsafe fn switch_address_space(directory: PhysAddr) {
    cpu::write_cr3(directory.0);
}

/// CR0.PG を立てる。すでに有効なら何もしない。
///
/// # Safety
/// 直前に switch_address_space() で恒等マップ済みの空間を読み込んでいること。
pub unsafe fn enable_paging() {
    let cr0 = cpu::read_cr0();
    if cr0 & CR0_PAGING != 0 {
        return;
    }
    cpu::write_cr0(cr0 | CR0_PAGING);
    logging::info("paging enabled");
}
