//! High-precision time core.
//!
//! The TSC is the clocksource; the legacy PIT provides both the
//! calibration reference and the 1 kHz scheduler tick:
//! - PIT channel 2, gated through the speaker-control port, times a
//!   ~10 ms window in which the TSC delta is measured (no IRQ
//!   dependency, works identically under BIOS and UEFI firmware).
//! - PIT channel 0 runs in square-wave mode at ~1 kHz; every tick
//!   drives the scheduler switch from IRQ0.
//!
//! All clock queries return 0 until calibration has run.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::{pause, rdtsc};
use crate::log::logger::try_get_logger;

/// Base oscillator frequency of the 8254 PIT in Hz.
const PIT_FREQUENCY: u64 = 1_193_182;

/// Scheduler tick rate.
pub const TICK_HZ: u64 = 1000;

const PIT_CMD: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_CHANNEL2: u16 = 0x42;
const SPEAKER_PORT: u16 = 0x61;

/// Channel 2 count for the calibration window: ~10 ms at 1.193182 MHz.
const CALIBRATION_COUNT: u16 = 11932;

static PIT_TICKS: AtomicU64 = AtomicU64::new(0);
static TSC_FREQ_HZ: AtomicU64 = AtomicU64::new(0);
static TSC_FREQ_KHZ: AtomicU64 = AtomicU64::new(0);
static TSC_BOOT: AtomicU64 = AtomicU64::new(0);

/// Calibrate the TSC, then start the scheduler tick.
pub fn init() {
    calibrate_tsc();
    program_channel0((PIT_FREQUENCY / TICK_HZ) as u16);

    // The heap is not up yet, so no allocating format here.
    if let Some(logger) = try_get_logger() {
        logger.log_fmt(
            crate::log::Severity::Info,
            format_args!(
                "tsc {} MHz, scheduler tick {} Hz",
                TSC_FREQ_HZ.load(Ordering::Relaxed) / 1_000_000,
                TICK_HZ
            ),
        );
    }
}

#[cfg(target_os = "none")]
fn calibrate_tsc() {
    use x86_64::instructions::port::Port;

    let mut cmd: Port<u8> = Port::new(PIT_CMD);
    let mut ch2: Port<u8> = Port::new(PIT_CHANNEL2);
    let mut gate: Port<u8> = Port::new(SPEAKER_PORT);

    unsafe {
        // Gate channel 2 on, speaker off.
        let saved = gate.read();
        gate.write((saved & 0xFD) | 0x01);

        // Channel 2, lo/hi, mode 0 (interrupt on terminal count), binary.
        cmd.write(0xB0);
        ch2.write((CALIBRATION_COUNT & 0xFF) as u8);
        ch2.write((CALIBRATION_COUNT >> 8) as u8);

        let tsc_start = rdtsc();

        // OUT2 (bit 5) goes high when the count reaches zero.
        while gate.read() & 0x20 == 0 {
            pause();
        }

        let tsc_end = rdtsc();

        // Gate off again.
        gate.write(gate.read() & 0xFC);

        apply_calibration(tsc_end - tsc_start);
    }
}

#[cfg(not(target_os = "none"))]
fn calibrate_tsc() {}

/// The window is ~10 ms, so 100 windows per second.
fn apply_calibration(tsc_delta: u64) {
    let freq_hz = tsc_delta * 100;
    TSC_FREQ_HZ.store(freq_hz, Ordering::Relaxed);
    TSC_FREQ_KHZ.store(freq_hz / 1000, Ordering::Relaxed);
    TSC_BOOT.store(rdtsc(), Ordering::Relaxed);
}

#[cfg(target_os = "none")]
fn program_channel0(divisor: u16) {
    use x86_64::instructions::port::Port;

    let mut cmd: Port<u8> = Port::new(PIT_CMD);
    let mut ch0: Port<u8> = Port::new(PIT_CHANNEL0);
    unsafe {
        // Channel 0, lo/hi, mode 3 (square wave), binary.
        cmd.write(0x36);
        ch0.write((divisor & 0xFF) as u8);
        ch0.write((divisor >> 8) as u8);
    }
}

#[cfg(not(target_os = "none"))]
fn program_channel0(_divisor: u16) {}

/// Called from the IRQ0 path, once per PIT tick.
pub fn tick() {
    PIT_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn pit_ticks() -> u64 {
    PIT_TICKS.load(Ordering::Relaxed)
}

pub fn tsc() -> u64 {
    rdtsc()
}

pub fn frequency_hz() -> u64 {
    TSC_FREQ_HZ.load(Ordering::Relaxed)
}

#[inline]
fn tsc_since_boot() -> u64 {
    rdtsc().wrapping_sub(TSC_BOOT.load(Ordering::Relaxed))
}

pub fn ns() -> u64 {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return 0;
    }
    (tsc_since_boot() as u128 * 1_000_000 / khz as u128) as u64
}

pub fn us() -> u64 {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return 0;
    }
    tsc_since_boot() * 1000 / khz
}

pub fn ms() -> u64 {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return 0;
    }
    tsc_since_boot() / khz
}

pub fn sec() -> u64 {
    ms() / 1000
}

fn delay_until(tsc_target: u64) {
    while rdtsc() < tsc_target {
        pause();
    }
}

pub fn delay_ns(ns: u64) {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    delay_until(rdtsc() + ns * khz / 1_000_000);
}

pub fn delay_us(us: u64) {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    delay_until(rdtsc() + us * khz / 1000);
}

pub fn delay_ms(ms: u64) {
    let khz = TSC_FREQ_KHZ.load(Ordering::Relaxed);
    if khz == 0 {
        return;
    }
    delay_until(rdtsc() + ms * khz);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_divisor_is_about_1khz() {
        let divisor = PIT_FREQUENCY / TICK_HZ;
        assert_eq!(divisor, 1193);
        // 1193 * 1000 within 0.02% of the oscillator.
        assert!(PIT_FREQUENCY.abs_diff(divisor * TICK_HZ) < PIT_FREQUENCY / 1000);
    }

    #[test]
    fn calibration_window_is_ten_ms() {
        // count / oscillator = window length; 100 windows per second.
        let window_us = CALIBRATION_COUNT as u64 * 1_000_000 / PIT_FREQUENCY;
        assert!((9_990..=10_010).contains(&window_us));
    }

    #[test]
    fn clocks_follow_calibration() {
        // Before calibration every clock reads zero.
        assert_eq!(ms(), 0);
        assert_eq!(ns(), 0);
        assert_eq!(sec(), 0);

        // A 10 ms window of 30M cycles means a 3 GHz part.
        apply_calibration(30_000_000);
        assert_eq!(frequency_hz(), 3_000_000_000);

        // The boot timestamp was just taken, so elapsed ms is small.
        assert!(ms() < 1000);
    }
}
