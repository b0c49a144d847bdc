//! Fatal-error path.
//!
//! A panic disables interrupts, paints the reason, and tries exactly
//! one soft recovery: restart the interactive shell in place, on the
//! theory that a live console beats a dead machine. A second fatal
//! error, or a failed recovery, halts for good.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::vga::{self, Color};

static RECOVERY_ATTEMPTED: AtomicBool = AtomicBool::new(false);

pub fn kernel_panic(reason: &str) -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    vga::set_color(Color::White, Color::Red);
    vga::print("\n\n!! KERNEL PANIC !!\n");
    vga::print("Reason: ");
    vga::print(reason);
    vga::print("\n\n");

    if !RECOVERY_ATTEMPTED.swap(true, Ordering::SeqCst) {
        vga::set_color(Color::LightGreen, Color::Black);
        vga::print("Attempting soft recovery: restarting shell...\n");
        crate::arch::x86_64::enable_interrupts();
        crate::shell::init();
        crate::shell::run();
        // The shell loop returning means recovery failed.
    }

    vga::set_color(Color::Red, Color::Black);
    vga::print("System halted (recovery failed).\n");
    halt_forever()
}

fn halt_forever() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
    loop {
        crate::sync::wait_for_interrupt();
    }
}

/// Rust panics funnel into the same fatal path. Host builds use the
/// std handler instead.
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    vga::set_color(Color::White, Color::Red);
    vga::print_fmt(format_args!("\nrust panic: {}\n", info));
    kernel_panic("Rust panic")
}
