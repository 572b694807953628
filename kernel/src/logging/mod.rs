// kernel/src/logging/mod.rs
//
// カーネルログ。
// - ベアメタル（i686）: VGA テキスト画面 + COM1 シリアル
// - ホスト（std feature）: 標準出力
// - 数値はヒープを使わずに文字列化する

#[cfg(all(target_arch = "x86", not(feature = "std")))]
mod serial;
#[cfg(all(target_arch = "x86", not(feature = "std")))]
mod vga;

pub fn init() {
    #[cfg(all(target_arch = "x86", not(feature = "std")))]
    {
        vga::init();
        serial::init();
    }
}

/// ログレベル。行頭の接頭辞と画面の文字色を決める。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    const fn prefix(self) -> &'static str {
        match self {
            Level::Info => "[INFO] ",
            Level::Warn => "[WARN] ",
            Level::Error => "[ERROR] ",
        }
    }
}

pub fn info(msg: &str) {
    emit(Level::Info, "", msg);
}

pub fn warn(msg: &str) {
    emit(Level::Warn, "", msg);
}

pub fn error(msg: &str) {
    emit(Level::Error, "", msg);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);
    emit(Level::Info, key, s);
}

/// アドレス向け（0x 付き 16 進）
pub fn info_hex(key: &str, value: u64) {
    let mut buf = [0u8; 18];
    let s = u64_to_hex(value, &mut buf);
    emit(Level::Info, key, s);
}

#[cfg(feature = "std")]
fn emit(level: Level, key: &str, value: &str) {
    let prefix = level.prefix();
    if key.is_empty() {
        std::println!("{prefix}{value}");
    } else {
        std::println!("{prefix}{key} = {value}");
    }
}

#[cfg(all(target_arch = "x86", not(feature = "std")))]
fn emit(level: Level, key: &str, value: &str) {
    let prefix = level.prefix();

    vga::set_level(level);
    vga::write_str(prefix);
    if !key.is_empty() {
        vga::write_str(key);
        vga::write_str(" = ");
    }
    vga::write_line(value);

    serial::write_str(prefix);
    if !key.is_empty() {
        serial::write_str(key);
        serial::write_str(" = ");
    }
    serial::write_line(value);
}

#[cfg(all(not(target_arch = "x86"), not(feature = "std")))]
fn emit(_level: Level, _key: &str, _value: &str) {}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 21]) -> &str {
    if value == 0 {
        let last = buf.len() - 1;
        buf[last] = b'0';
        return unsafe { core::str::from_utf8_unchecked(&buf[last..]) };
    }

    let mut i = buf.len();
    while value > 0 {
        let digit = (value % 10) as u8;
        i -= 1;
        buf[i] = b'0' + digit;
        value /= 10;
    }

    unsafe { core::str::from_utf8_unchecked(&buf[i..]) }
}

fn u64_to_hex(mut value: u64, buf: &mut [u8; 18]) -> &str {
    let mut i = buf.len();
    loop {
        let n = (value & 0xF) as u8;
        i -= 1;
        buf[i] = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    i -= 1;
    buf[i] = b'x';
    i -= 1;
    buf[i] = b'0';

    unsafe { core::str::from_utf8_unchecked(&buf[i..]) }
}
