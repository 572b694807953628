// kernel/src/error.rs
//
// カーネル全体で共有するエラー分類。
// - 各モジュールのローカルなエラー（AddressSpaceError / FileError / ElfError）は
//   From でここへ寄せる。呼び出し側は ? で伝播するだけでよい。
// - status() はユーザプログラムへ返す負のステータス値。

use core::fmt;

use crate::fs::FileError;
use crate::loader::elf::ElfError;
use crate::mem::address_space::AddressSpaceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// カーネルヒープから確保できなかった
    OutOfMemory,
    /// 境界に揃っていないアドレス、範囲の逆転、空の引数など
    InvalidArgument,
    /// プロセス表や割り当て表に空きがない
    ResourceExhausted,
    /// ファイルストアがパスを解決できなかった
    NotFound,
    /// ファイルストアの読み出し失敗など
    Io,
    /// どのローダもイメージを受け付けなかった
    UnsupportedFormat,
    /// 追跡していない資源の解放要求（呼び出し側は無視してよい）
    UnknownResource,
    /// 最後のプロセスが終了した（システム停止）
    NoProcessLeft,
}

impl KernelError {
    /// ユーザ空間へ返すステータス値（常に負）
    pub fn status(self) -> i32 {
        match self {
            KernelError::Io => -1,
            KernelError::InvalidArgument => -2,
            KernelError::OutOfMemory => -3,
            KernelError::NotFound => -4,
            KernelError::ResourceExhausted => -5,
            KernelError::UnsupportedFormat => -6,
            KernelError::UnknownResource => -7,
            KernelError::NoProcessLeft => -8,
        }
    }

    /// システムを止めるしかないエラーかどうか
    pub fn is_fatal(self) -> bool {
        matches!(self, KernelError::NoProcessLeft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::ResourceExhausted => "resource exhausted",
            KernelError::NotFound => "not found",
            KernelError::Io => "i/o error",
            KernelError::UnsupportedFormat => "unsupported image format",
            KernelError::UnknownResource => "unknown resource",
            KernelError::NoProcessLeft => "no process left",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AddressSpaceError> for KernelError {
    fn from(e: AddressSpaceError) -> Self {
        match e {
            AddressSpaceError::InvalidArgument => KernelError::InvalidArgument,
            AddressSpaceError::OutOfMemory => KernelError::OutOfMemory,
        }
    }
}

impl From<FileError> for KernelError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound => KernelError::NotFound,
            FileError::Io => KernelError::Io,
            FileError::InvalidArgument => KernelError::InvalidArgument,
        }
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        match e {
            ElfError::OutOfMemory => KernelError::OutOfMemory,
            ElfError::NotThisFormat | ElfError::Malformed | ElfError::Unsupported => {
                KernelError::UnsupportedFormat
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_negative_and_distinct() {
        let all = [
            KernelError::OutOfMemory,
            KernelError::InvalidArgument,
            KernelError::ResourceExhausted,
            KernelError::NotFound,
            KernelError::Io,
            KernelError::UnsupportedFormat,
            KernelError::UnknownResource,
            KernelError::NoProcessLeft,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.status() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
        }
    }

    #[test]
    fn only_no_process_left_is_fatal() {
        assert!(KernelError::NoProcessLeft.is_fatal());
        assert!(!KernelError::OutOfMemory.is_fatal());
        assert!(!KernelError::UnknownResource.is_fatal());
    }
}
