// kernel/src/logging/vga.rs
//
// VGA テキスト画面（80x25, 0xB8000）へのログ出力。
// - 行末まで来たら折り返し、最下行を越えたら 1 行ずつ上へ送る。
// - ログレベルごとに文字色を変える（WARN は黄、ERROR は赤）。
//
// 0xB8000 はカーネル空間・全ユーザ空間で恒等マップされている前提。

use spin::Mutex;
use volatile::Volatile;

use super::Level;

const ROWS: usize = 25;
const COLS: usize = 80;
const VGA_TEXT_ADDRESS: usize = 0xB8000;

/// 表示できない文字の代わり（■）
const REPLACEMENT: u8 = 0xFE;

/// 上位 8bit が属性（背景は黒固定）、下位 8bit が文字
type Cell = Volatile<u16>;

const fn cell(ch: u8, attribute: u8) -> u16 {
    (attribute as u16) << 8 | ch as u16
}

const fn attribute_of(level: Level) -> u8 {
    match level {
        Level::Info => 0x07,
        Level::Warn => 0x0E,
        Level::Error => 0x0C,
    }
}

struct Screen {
    cells: &'static mut [[Cell; COLS]; ROWS],
    row: usize,
    col: usize,
    attribute: u8,
}

impl Screen {
    fn put(&mut self, byte: u8) {
        if byte == b'\n' {
            self.newline();
            return;
        }
        if self.col == COLS {
            self.newline();
        }

        let ch = if (0x20..0x7F).contains(&byte) { byte } else { REPLACEMENT };
        self.cells[self.row][self.col].write(cell(ch, self.attribute));
        self.col += 1;
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < ROWS {
            self.row += 1;
            return;
        }

        for r in 1..ROWS {
            for c in 0..COLS {
                let v = self.cells[r][c].read();
                self.cells[r - 1][c].write(v);
            }
        }
        let blank = cell(b' ', attribute_of(Level::Info));
        for c in self.cells[ROWS - 1].iter_mut() {
            c.write(blank);
        }
    }

    fn clear(&mut self) {
        let blank = cell(b' ', attribute_of(Level::Info));
        for row in self.cells.iter_mut() {
            for c in row.iter_mut() {
                c.write(blank);
            }
        }
        self.row = 0;
        self.col = 0;
    }
}

static SCREEN: Mutex<Option<Screen>> = Mutex::new(None);

pub fn init() {
    // Safety: 0xB8000 は VGA テキストバッファ。触るのはこのモジュールだけ
    let cells = unsafe { &mut *(VGA_TEXT_ADDRESS as *mut [[Cell; COLS]; ROWS]) };
    let mut screen = Screen {
        cells,
        row: 0,
        col: 0,
        attribute: attribute_of(Level::Info),
    };
    screen.clear();
    *SCREEN.lock() = Some(screen);
}

pub fn set_level(level: Level) {
    if let Some(screen) = SCREEN.lock().as_mut() {
        screen.attribute = attribute_of(level);
    }
}

pub fn write_str(s: &str) {
    if let Some(screen) = SCREEN.lock().as_mut() {
        for b in s.bytes() {
            screen.put(b);
        }
    }
}

pub fn write_line(s: &str) {
    if let Some(screen) = SCREEN.lock().as_mut() {
        for b in s.bytes() {
            screen.put(b);
        }
        screen.put(b'\n');
    }
}
