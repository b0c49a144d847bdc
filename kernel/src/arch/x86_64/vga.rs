//! VGA text-mode console.
//!
//! 80x25 cells at physical 0xB8000, hardware cursor via the CRTC
//! index/data ports. Writers hold an interrupt-masking lock for the
//! whole string so IRQ-side logging cannot interleave mid-line, and
//! every byte is mirrored to the serial port.

use core::fmt::{self, Write};
use volatile::Volatile;
use x86_64::instructions::port::Port;

use crate::arch::x86_64::serial;
use crate::sync::IrqMutex;

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;
pub const VGA_ADDRESS: usize = 0xb8000;

const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(fg: Color, bg: Color) -> Self {
        Self((bg as u8) << 4 | (fg as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    pub ascii_character: u8,
    pub color_code: ColorCode,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    row: usize,
    col: usize,
    color_code: ColorCode,
    buffer: *mut Buffer,
}

// The raw framebuffer pointer refers to device memory that only this
// writer (behind its lock) ever touches.
unsafe impl Send for Writer {}

static WRITER: IrqMutex<Writer> = IrqMutex::new(Writer::new());

impl Writer {
    const fn new() -> Self {
        Self {
            row: 0,
            col: 0,
            color_code: ColorCode::new(Color::LightGray, Color::Black),
            buffer: VGA_ADDRESS as *mut Buffer,
        }
    }

    fn buf(&mut self) -> &mut Buffer {
        unsafe { &mut *self.buffer }
    }

    pub fn write_byte(&mut self, byte: u8) {
        serial::mirror_byte(byte);
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                let ch = ScreenChar {
                    ascii_character: byte,
                    color_code: self.color_code,
                };
                let (row, col) = (self.row, self.col);
                self.buf().chars[row][col].write(ch);
                self.col += 1;
            }
        }
    }

    /// Erase the cell before the cursor (shell line editing).
    pub fn backspace(&mut self) {
        if self.col == 0 {
            return;
        }
        self.col -= 1;
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        let (row, col) = (self.row, self.col);
        self.buf().chars[row][col].write(blank);
        serial::mirror_byte(0x08);
        serial::mirror_byte(b' ');
        serial::mirror_byte(0x08);
    }

    fn new_line(&mut self) {
        if self.row + 1 >= BUFFER_HEIGHT {
            self.scroll_up();
        } else {
            self.row += 1;
        }
        self.col = 0;
    }

    fn scroll_up(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let ch = self.buf().chars[row][col].read();
                self.buf().chars[row - 1][col].write(ch);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buf().chars[row][col].write(blank);
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.col = 0;
    }

    pub fn set_color(&mut self, fg: Color, bg: Color) {
        self.color_code = ColorCode::new(fg, bg);
    }

    fn sync_cursor(&self) {
        let pos = (self.row * BUFFER_WIDTH + self.col) as u16;
        let mut index: Port<u8> = Port::new(CRTC_INDEX);
        let mut data: Port<u8> = Port::new(CRTC_DATA);
        unsafe {
            index.write(0x0E);
            data.write((pos >> 8) as u8);
            index.write(0x0F);
            data.write((pos & 0xFF) as u8);
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

pub fn init() {
    let mut writer = WRITER.lock();
    writer.clear();
    writer.sync_cursor();
}

/// Print to the console (IRQs masked for the whole string).
pub fn print(s: &str) {
    let mut writer = WRITER.lock();
    writer.write_str(s).ok();
    writer.sync_cursor();
}

/// Formatted print without heap allocation; safe in fault paths.
pub fn print_fmt(args: fmt::Arguments) {
    let mut writer = WRITER.lock();
    writer.write_fmt(args).ok();
    writer.sync_cursor();
}

pub fn backspace() {
    let mut writer = WRITER.lock();
    writer.backspace();
    writer.sync_cursor();
}

pub fn clear() {
    let mut writer = WRITER.lock();
    writer.clear();
    writer.sync_cursor();
}

pub fn set_color(fg: Color, bg: Color) {
    WRITER.lock().set_color(fg, bg);
}
