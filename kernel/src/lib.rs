// kernel/src/lib.rs
//
// proc-kernel: 32bit シングル CPU (ring0/ring3) カーネルの
// 「プロセス / タスク / アドレス空間」コア。
//
// 役割:
// - 2 段ページテーブルによるプロセスごとの仮想アドレス空間
// - 実行イメージ（ELF / フラットバイナリ）のロード
// - プロセスと 1:1 に対応するタスクのリング管理と ring3 への遷移
// - ユーザプログラムが確保したメモリの追跡と一括回収
//
// 方針:
// - ハードウェアに触る部分（CR3 / iret / hlt）は arch::PrivilegeRuntime の裏に閉じ込める。
// - 物理メモリは mm::PhysMemory 経由でのみ読み書きする。
//   ホスト上では Vec で模擬できるので、cargo test がそのまま通る。
// - std feature はホストでのテスト用。ベアメタルでは no_std + alloc で動く。

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod logging;
pub mod mem;
pub mod mm;

#[cfg(any(test, feature = "std"))]
pub mod mock;

pub use error::KernelError;
