//! Interrupt entry stubs.
//!
//! Every vector funnels through a naked stub that normalizes the
//! stack into one uniform [`InterruptFrame`]: the CPU-pushed tail
//! (SS, RSP, RFLAGS, CS, RIP, maybe an error code), a software-pushed
//! vector number and dummy error code, all fifteen GPRs, and the data
//! segment selectors. The frame address is handed to the Rust
//! dispatchers in `rdi`.
//!
//! The IRQ path is special: its dispatcher returns a stack pointer in
//! `rax`, and the epilogue reloads RSP from it before IRET. That is
//! the whole context-switch mechanism — when the scheduler picks a
//! different task, the returned pointer is the frame saved on that
//! task's stack, and IRET resumes it.

use core::arch::naked_asm;

/// Uniform saved-register frame, lowest address first. Must match the
/// push order in the stubs below exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// The three common tails share one prologue/epilogue shape:
//
// Prologue: 15 GPR pushes, then the segment selectors (ds, es, fs, gs
// top-down, so gs lands lowest). rax doubles as the segment scratch;
// its live value is already in the frame by then.
//
// Epilogue: reload ds/es from the frame (the fs/gs selector slots are
// popped but not reloaded, so their bases stay live), restore the
// GPRs, drop int_no/err_code, IRET.

/// Common exception tail: build the frame, dispatch, unwind, IRET.
/// The dispatcher normally panics; the return path exists for the
/// soft-recovery story.
#[unsafe(naked)]
unsafe extern "C" fn exception_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, ds",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, gs",
        "push rax",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop rax", // gs slot
        "pop rax", // fs slot
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym exception_dispatch,
    );
}

/// Common IRQ tail. The dispatcher returns the stack pointer to
/// resume from — identical to the input unless the scheduler switched
/// tasks.
#[unsafe(naked)]
unsafe extern "C" fn irq_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, ds",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, gs",
        "push rax",
        "mov rdi, rsp",
        "call {dispatch}",
        "mov rsp, rax",
        "pop rax", // gs slot
        "pop rax", // fs slot
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym irq_dispatch,
    );
}

/// `int 0x80` tail: same frame; the dispatcher stores the syscall
/// result into the frame's rax slot, which the epilogue reloads.
#[unsafe(naked)]
unsafe extern "C" fn syscall_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rax, ds",
        "push rax",
        "mov rax, es",
        "push rax",
        "mov rax, fs",
        "push rax",
        "mov rax, gs",
        "push rax",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop rax", // gs slot
        "pop rax", // fs slot
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym syscall_dispatch,
    );
}

// Exceptions where the CPU pushes an error code of its own.
macro_rules! isr_stub_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym exception_common,
            );
        }
    };
}

// Exceptions without a CPU error code get a dummy zero so the frame
// layout stays uniform.
macro_rules! isr_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym exception_common,
            );
        }
    };
}

macro_rules! irq_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym irq_common,
            );
        }
    };
}

isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_err!(isr8, 8);
isr_stub!(isr9, 9);
isr_stub_err!(isr10, 10);
isr_stub_err!(isr11, 11);
isr_stub_err!(isr12, 12);
isr_stub_err!(isr13, 13);
isr_stub_err!(isr14, 14);
isr_stub!(isr15, 15);
isr_stub!(isr16, 16);
isr_stub_err!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub!(isr21, 21);
isr_stub!(isr22, 22);
isr_stub!(isr23, 23);
isr_stub!(isr24, 24);
isr_stub!(isr25, 25);
isr_stub!(isr26, 26);
isr_stub!(isr27, 27);
isr_stub!(isr28, 28);
isr_stub!(isr29, 29);
isr_stub_err!(isr30, 30);
isr_stub!(isr31, 31);

irq_stub!(irq0, 32);
irq_stub!(irq1, 33);
irq_stub!(irq2, 34);
irq_stub!(irq3, 35);
irq_stub!(irq4, 36);
irq_stub!(irq5, 37);
irq_stub!(irq6, 38);
irq_stub!(irq7, 39);
irq_stub!(irq8, 40);
irq_stub!(irq9, 41);
irq_stub!(irq10, 42);
irq_stub!(irq11, 43);
irq_stub!(irq12, 44);
irq_stub!(irq13, 45);
irq_stub!(irq14, 46);
irq_stub!(irq15, 47);

/// `int 0x80` entry.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_stub() {
    naked_asm!(
        "push 0",
        "push 0x80",
        "jmp {common}",
        common = sym syscall_common,
    );
}

#[no_mangle]
extern "C" fn exception_dispatch(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    super::idt::on_exception(frame);
}

#[no_mangle]
extern "C" fn irq_dispatch(frame: *mut InterruptFrame) -> u64 {
    let frame = unsafe { &mut *frame };
    super::idt::on_irq(frame)
}

#[no_mangle]
extern "C" fn syscall_dispatch(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    crate::syscall::dispatch(frame);
}

#[cfg(test)]
mod tests {
    use super::InterruptFrame;
    use core::mem::size_of;

    #[test]
    fn frame_matches_stub_layout() {
        // 4 segments + 15 GPRs + int_no/err_code + 5-word CPU tail.
        assert_eq!(size_of::<InterruptFrame>(), 26 * 8);
        let frame = InterruptFrame {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            int_no: 32,
            err_code: 0,
            rip: 0,
            cs: 0x08,
            rflags: 0x202,
            rsp: 0,
            ss: 0x10,
        };
        let base = &frame as *const _ as usize;
        let int_no_off = &frame.int_no as *const _ as usize - base;
        assert_eq!(int_no_off, 19 * 8);
    }
}
