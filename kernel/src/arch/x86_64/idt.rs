//! Interrupt Descriptor Table for x86_64 long mode.
//!
//! 256 gates: CPU exceptions on 0-31, the remapped PIC IRQs on 32-47,
//! and the `int 0x80` syscall trap. All gates target the kernel code
//! segment the stage-2 loader installed (selector 0x08), with IST 0.

use core::arch::asm;
use core::mem::size_of;
use core::ptr::addr_of_mut;

use crate::arch::x86_64::interrupts::{self, InterruptFrame};
use crate::arch::x86_64::{irq, keyboard, pic, time::timer, vga};
use crate::sched;

const IDT_ENTRIES: usize = 256;

/// GDT selector for the ring-0 code segment.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Present, DPL 0, 64-bit interrupt gate.
pub const GATE_INTERRUPT: u8 = 0x8E;
/// Present, DPL 3, 64-bit trap gate (syscall entry).
pub const GATE_TRAP_DPL3: u8 = 0xEF;

/// Syscall vector.
pub const SYSCALL_VECTOR: usize = 0x80;

/// x86_64 IDT entry (16 bytes).
#[repr(C, packed)]
#[derive(Copy, Clone)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }
}

#[repr(C, packed)]
struct IdtDescriptor {
    limit: u16,
    base: u64,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

/// Exception names per the classic table; everything from 21 up is
/// reported as Reserved.
static EXCEPTION_MESSAGES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Install one gate descriptor. Boot-time only; the table is not
/// touched after `lidt`.
pub fn set_gate(num: usize, handler: u64, selector: u16, type_attr: u8) {
    if num >= IDT_ENTRIES {
        return;
    }
    let entry = IdtEntry {
        offset_low: (handler & 0xFFFF) as u16,
        selector,
        ist: 0,
        type_attr,
        offset_mid: ((handler >> 16) & 0xFFFF) as u16,
        offset_high: ((handler >> 32) & 0xFFFF_FFFF) as u32,
        _reserved: 0,
    };
    unsafe {
        (*addr_of_mut!(IDT))[num] = entry;
    }
}

macro_rules! gate {
    ($num:expr, $stub:path) => {
        set_gate($num, $stub as usize as u64, KERNEL_CODE_SELECTOR, GATE_INTERRUPT)
    };
}

/// Remap the PIC and install every gate, then load the table.
pub fn init() {
    pic::init();

    gate!(0, interrupts::isr0);
    gate!(1, interrupts::isr1);
    gate!(2, interrupts::isr2);
    gate!(3, interrupts::isr3);
    gate!(4, interrupts::isr4);
    gate!(5, interrupts::isr5);
    gate!(6, interrupts::isr6);
    gate!(7, interrupts::isr7);
    gate!(8, interrupts::isr8);
    gate!(9, interrupts::isr9);
    gate!(10, interrupts::isr10);
    gate!(11, interrupts::isr11);
    gate!(12, interrupts::isr12);
    gate!(13, interrupts::isr13);
    gate!(14, interrupts::isr14);
    gate!(15, interrupts::isr15);
    gate!(16, interrupts::isr16);
    gate!(17, interrupts::isr17);
    gate!(18, interrupts::isr18);
    gate!(19, interrupts::isr19);
    gate!(20, interrupts::isr20);
    gate!(21, interrupts::isr21);
    gate!(22, interrupts::isr22);
    gate!(23, interrupts::isr23);
    gate!(24, interrupts::isr24);
    gate!(25, interrupts::isr25);
    gate!(26, interrupts::isr26);
    gate!(27, interrupts::isr27);
    gate!(28, interrupts::isr28);
    gate!(29, interrupts::isr29);
    gate!(30, interrupts::isr30);
    gate!(31, interrupts::isr31);

    gate!(32, interrupts::irq0);
    gate!(33, interrupts::irq1);
    gate!(34, interrupts::irq2);
    gate!(35, interrupts::irq3);
    gate!(36, interrupts::irq4);
    gate!(37, interrupts::irq5);
    gate!(38, interrupts::irq6);
    gate!(39, interrupts::irq7);
    gate!(40, interrupts::irq8);
    gate!(41, interrupts::irq9);
    gate!(42, interrupts::irq10);
    gate!(43, interrupts::irq11);
    gate!(44, interrupts::irq12);
    gate!(45, interrupts::irq13);
    gate!(46, interrupts::irq14);
    gate!(47, interrupts::irq15);

    set_gate(
        SYSCALL_VECTOR,
        interrupts::syscall_stub as usize as u64,
        KERNEL_CODE_SELECTOR,
        GATE_TRAP_DPL3,
    );

    load();
}

fn load() {
    unsafe {
        let descriptor = IdtDescriptor {
            limit: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
            base: addr_of_mut!(IDT) as u64,
        };
        asm!("lidt [{}]", in(reg) &descriptor, options(readonly, nostack, preserves_flags));
    }
}

/// Exception printer. Dumps the full frame to VGA + serial (no heap
/// use: this can fire before the allocator exists), then panics; the
/// panic path attempts one shell soft-recovery before halting.
pub fn on_exception(frame: &mut InterruptFrame) {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();

    let name = EXCEPTION_MESSAGES
        .get(frame.int_no as usize)
        .copied()
        .unwrap_or("Unknown Exception");

    let cr2 = read_cr2();

    vga::set_color(vga::Color::White, vga::Color::Red);
    vga::print("\n\n*** KERNEL EXCEPTION ***\n");
    vga::print_fmt(format_args!(
        "Exception: {} (vector {})\nError Code: {:#x}  CR2: {:#x}\n",
        name, frame.int_no, frame.err_code, cr2
    ));
    vga::print_fmt(format_args!(
        "RIP: {:#018x}  CS: {:#06x}  RFLAGS: {:#010x}\nRSP: {:#018x}  SS: {:#06x}\n",
        frame.rip, frame.cs, frame.rflags, frame.rsp, frame.ss
    ));
    vga::print_fmt(format_args!(
        "RAX={:#018x} RBX={:#018x} RCX={:#018x}\nRDX={:#018x} RSI={:#018x} RDI={:#018x}\n",
        frame.rax, frame.rbx, frame.rcx, frame.rdx, frame.rsi, frame.rdi
    ));
    vga::print_fmt(format_args!(
        "RBP={:#018x} R8 ={:#018x} R9 ={:#018x}\nR10={:#018x} R11={:#018x} R12={:#018x}\n",
        frame.rbp, frame.r8, frame.r9, frame.r10, frame.r11, frame.r12
    ));
    vga::print_fmt(format_args!(
        "R13={:#018x} R14={:#018x} R15={:#018x}\n",
        frame.r13, frame.r14, frame.r15
    ));

    crate::panic::kernel_panic("Unhandled CPU Exception");
}

#[cfg(target_os = "none")]
fn read_cr2() -> u64 {
    x86_64::registers::control::Cr2::read().as_u64()
}

#[cfg(not(target_os = "none"))]
fn read_cr2() -> u64 {
    0
}

/// IRQ demultiplexer. Returns the stack pointer the entry stub should
/// resume from; only the timer path can change it.
pub fn on_irq(frame: &mut InterruptFrame) -> u64 {
    let mut next_rsp = frame as *mut InterruptFrame as u64;
    let vector = frame.int_no;
    if !(32..48).contains(&vector) {
        return next_rsp;
    }
    let irq_line = (vector - 32) as u8;

    if pic::is_spurious(irq_line) {
        pic::spurious_eoi(irq_line);
        return next_rsp;
    }

    match irq_line {
        0 => {
            timer::tick();
            next_rsp = sched::switch(next_rsp);
        }
        1 => keyboard::handle_irq(),
        line => irq::dispatch(line),
    }

    pic::end_of_interrupt(irq_line);
    next_rsp
}
