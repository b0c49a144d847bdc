//! Severity-tagged logger over the console.
//!
//! A single global instance lives behind `try_get_logger()`; code
//! that may run before `init` (early boot, fault paths) checks for
//! `None` and stays quiet. Output goes through the VGA writer, which
//! mirrors every byte to the serial port, so one call reaches both
//! sinks. The logger itself never allocates.

use core::sync::atomic::{AtomicU8, Ordering};
use spin::Once;

use crate::arch::x86_64::vga::{self, Color};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Severity::Debug => "[ dbg] ",
            Severity::Info => "[info] ",
            Severity::Warn => "[warn] ",
            Severity::Error => "[ err] ",
        }
    }

    fn color(self) -> Color {
        match self {
            Severity::Debug => Color::Cyan,
            Severity::Info => Color::LightGreen,
            Severity::Warn => Color::Yellow,
            Severity::Error => Color::LightRed,
        }
    }
}

pub struct Logger {
    min_severity: AtomicU8,
}

impl Logger {
    fn new(min: Severity) -> Self {
        Self {
            min_severity: AtomicU8::new(min as u8),
        }
    }

    /// Untagged line, Info level.
    pub fn log(&self, msg: &str) {
        self.log_at(Severity::Info, msg);
    }

    pub fn log_at(&self, severity: Severity, msg: &str) {
        if (severity as u8) < self.min_severity.load(Ordering::Relaxed) {
            return;
        }
        vga::set_color(severity.color(), Color::Black);
        vga::print(severity.tag());
        vga::set_color(Color::LightGray, Color::Black);
        vga::print(msg);
        vga::print("\n");
    }

    /// Formatted logging without heap allocation, usable before the
    /// allocator is up.
    pub fn log_fmt(&self, severity: Severity, args: core::fmt::Arguments) {
        if (severity as u8) < self.min_severity.load(Ordering::Relaxed) {
            return;
        }
        vga::set_color(severity.color(), Color::Black);
        vga::print(severity.tag());
        vga::set_color(Color::LightGray, Color::Black);
        vga::print_fmt(args);
        vga::print("\n");
    }
}

static LOGGER: Once<Logger> = Once::new();

pub fn init() {
    LOGGER.call_once(|| Logger::new(Severity::Info));
}

pub fn try_get_logger() -> Option<&'static Logger> {
    LOGGER.get()
}

/// One-line warning, quiet before `init` (early boot, fault paths).
pub fn log_warn(msg: &str) {
    if let Some(logger) = try_get_logger() {
        logger.log_at(Severity::Warn, msg);
    }
}
