// kernel/src/mem/layout.rs
//
// 32bit 仮想アドレスレイアウト（ユーザプログラムから見える固定値）
//
//   0x003F_B000 ..  0x003F_F000   ユーザスタック（下向きに伸びる、16KiB）
//   0x0040_0000 ..                プログラム本体（フラットバイナリのロード先）
//   0x0100_0000 ..  +100MiB       カーネルヒープ（恒等マップ）
//
// ユーザのヒープ確保（malloc）は物理アドレスと同じ仮想アドレスにマップされる。

/// プログラムのロード先（フラットバイナリのエントリでもある）
pub const PROGRAM_VIRTUAL_ADDRESS: u32 = 0x0040_0000;

pub const USER_PROGRAM_STACK_SIZE: u32 = 1024 * 16;

/// スタックの先頭（初期 esp）
pub const USER_STACK_START: u32 = 0x003F_F000;

/// スタックの末尾（最下位アドレス）
pub const USER_STACK_END: u32 = USER_STACK_START - USER_PROGRAM_STACK_SIZE;

/// ring3 のセレクタ（RPL=3 込み）
pub const USER_CODE_SELECTOR: u32 = 0x1B;
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// カーネルヒープ（ベアメタル時）
pub const KERNEL_HEAP_ADDRESS: u32 = 0x0100_0000;
pub const KERNEL_HEAP_SIZE_BYTES: u32 = 100 * 1024 * 1024;
pub const KERNEL_HEAP_TABLE_ADDRESS: u32 = 0x0000_7E00;
