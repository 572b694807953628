// kernel/src/mem/mod.rs
//
// 32bit アドレス空間まわり。
// - addr: PhysAddr / VirtAddr と 4KiB 境界の計算
// - paging: エントリのビット表現（PageFlags / PageEntry）
// - address_space: プロセスごとの 2 段ページテーブル
// - layout: ユーザプログラムから見える固定アドレス

pub mod addr;
pub mod address_space;
pub mod layout;
pub mod paging;

pub use self::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use self::address_space::{AddressSpace, AddressSpaceError};
