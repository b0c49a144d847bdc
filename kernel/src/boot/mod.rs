//! Boot glue: stage-2 handoff, init ordering, banner.
//!
//! The loader leaves the CPU in long mode with low memory identity
//! mapped, a valid stack, and `rdi` pointing at the boot-info block.
//! `kernel_main` brings the subsystems up leaves-first, reports each
//! one on the console, spawns the shell, and settles into the idle
//! loop as task 0.

use core::ptr::{addr_of, addr_of_mut};

use crate::arch::x86_64::time::timer;
use crate::arch::x86_64::{idt, irq, keyboard, serial, vga};
use crate::log::logger::try_get_logger;
use crate::log::Severity;
use crate::{caps, ipc, memory, sched, shell, syscall};

/// Boot-info magic cookie.
pub const BOOT_MAGIC: u64 = 0xDEAD_BEEF;

/// Memory-map entry types.
pub const E820_USABLE: u32 = 1;
pub const E820_RESERVED: u32 = 2;
pub const E820_ACPI: u32 = 3;
pub const E820_NVS: u32 = 4;
pub const E820_UNUSABLE: u32 = 5;

/// Handoff block at the address stage-2 passes in `rdi`. The last
/// three fields are outputs the kernel fills in for diagnostics.
#[repr(C, packed)]
pub struct BootInfo {
    pub magic: u64,
    pub e820_count: u16,
    pub reserved: u16,
    pub total_memory_mb: u32,
    pub secure_base: u64,
    pub heap_base: u64,
    pub heap_size: u64,
}

/// One firmware memory-map entry; an array of `e820_count` of these
/// immediately follows the boot-info block.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct E820Entry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub attrs: u32,
}

/// Bare-metal entry point; the loader jumps here with `rdi` set.
#[cfg(all(target_os = "none", not(test)))]
#[no_mangle]
pub extern "C" fn _start(info: *mut BootInfo) -> ! {
    kernel_main(info)
}

fn print_banner() {
    vga::set_color(vga::Color::LightCyan, vga::Color::Black);
    vga::print("\n  ========================================\n");
    vga::print("   corten kernel 0.1.0 (x86_64)\n");
    vga::print("  ========================================\n\n");
    vga::set_color(vga::Color::White, vga::Color::Black);
}

fn print_init(component: &str, success: bool) {
    vga::print("  [");
    if success {
        vga::set_color(vga::Color::Green, vga::Color::Black);
        vga::print(" OK ");
    } else {
        vga::set_color(vga::Color::Red, vga::Color::Black);
        vga::print("FAIL");
    }
    vga::set_color(vga::Color::White, vga::Color::Black);
    vga::print("] ");
    vga::print(component);
    vga::print("\n");
}

/// Validate the handoff block and return the memory map it carries.
/// A bad magic degrades to an empty map (fallback heap) rather than
/// halting.
unsafe fn memory_map(info: *mut BootInfo) -> &'static [E820Entry] {
    if info.is_null() {
        return &[];
    }
    let magic = addr_of!((*info).magic).read_unaligned();
    if magic != BOOT_MAGIC {
        return &[];
    }
    let count = addr_of!((*info).e820_count).read_unaligned() as usize;
    let entries = (info as usize + core::mem::size_of::<BootInfo>()) as *const E820Entry;
    core::slice::from_raw_parts(entries, count)
}

pub fn kernel_main(info: *mut BootInfo) -> ! {
    // Console first: serial for headless capture, VGA mirrored onto it.
    serial::init();
    vga::init();
    crate::log::init();

    print_banner();

    let boot_ok = !info.is_null()
        && unsafe { addr_of!((*info).magic).read_unaligned() } == BOOT_MAGIC;
    if !boot_ok {
        vga::set_color(vga::Color::Red, vga::Color::Black);
        vga::print("WARNING: bad boot info magic, continuing degraded\n");
        vga::set_color(vga::Color::White, vga::Color::Black);
    }

    // Interrupt plumbing (the IDT init remaps the PIC).
    idt::init();
    print_init("Interrupt Descriptor Table", true);
    irq::init();
    print_init("IRQ Demultiplexer", true);

    // Timer: TSC calibration plus the 1 kHz scheduler tick.
    timer::init();
    print_init("Timer (TSC/PIT)", true);

    keyboard::init();
    print_init("PS/2 Keyboard Driver", true);

    // Buddy heap + secure region from the firmware map.
    let map = unsafe { memory_map(info) };
    let plan = memory::plan_from_memory_map(map);
    unsafe { memory::init_from_plan(&plan) };
    print_init("Memory Allocator (Buddy)", !plan.from_fallback);
    if let Some(logger) = try_get_logger() {
        logger.log_fmt(
            Severity::Info,
            format_args!(
                "heap {} KiB at {:#x}, secure {:#x}",
                plan.heap_size / 1024,
                plan.heap_base,
                plan.secure_base.unwrap_or(0)
            ),
        );
    }

    // Report the layout back through the handoff block.
    if boot_ok {
        unsafe {
            addr_of_mut!((*info).heap_base).write_unaligned(plan.heap_base as u64);
            addr_of_mut!((*info).heap_size).write_unaligned(plan.heap_size as u64);
            addr_of_mut!((*info).secure_base)
                .write_unaligned(plan.secure_base.unwrap_or(0) as u64);
        }
    }

    ipc::init();
    print_init("IPC Message System", true);

    caps::init();
    print_init("Capability System", true);

    sched::init();
    syscall::init();
    print_init("Scheduler + Syscall Gate", true);

    // The shell runs as a task of its own, above everything else.
    let shell_ok = match sched::create_full(shell::shell_task, sched::PRIORITY_HIGH, sched::UID_ROOT)
    {
        Some(pid) => caps::create(
            pid as usize,
            0,
            caps::Capability::SHELL_ACCESS.bits()
                | caps::Capability::MEMORY_ALLOC.bits()
                | caps::Capability::MEMORY_FREE.bits()
                | caps::Capability::MSG_SEND.bits()
                | caps::Capability::MSG_RECEIVE.bits(),
        )
        .is_ok(),
        None => false,
    };
    print_init("Shell Task", shell_ok);

    vga::set_color(vga::Color::LightGreen, vga::Color::Black);
    vga::print("\n==> Kernel initialization complete\n\n");
    vga::set_color(vga::Color::White, vga::Color::Black);

    // From here on the timer owns the machine. This context is task 0,
    // the idle task: lowest priority, always runnable.
    crate::arch::x86_64::enable_interrupts();
    loop {
        crate::sync::wait_for_interrupt();
    }
}
