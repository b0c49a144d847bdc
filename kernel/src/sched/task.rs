//! Task control blocks.
//!
//! TCBs live in a fixed arena and thread a circular list through
//! slot indices; no kernel structure stores a pointer into another.
//! Each task owns a 4 KiB stack from the buddy heap with a canary in
//! its lowest word and a synthetic interrupt-return frame at its top,
//! so the very first dispatch reaches the entry point through the
//! normal IRET path.

use bitflags::bitflags;

/// Canary written to `stack_base[0]` for the task's whole lifetime.
pub const STACK_CANARY: u64 = 0xDEAD_CAFE_BABE_BEEF;

/// Per-task kernel stack size.
pub const TASK_STACK_SIZE: usize = 4096;

/// Kernel code / data selectors in the loader's GDT.
const KERNEL_CS: u64 = 0x08;
const KERNEL_DS: u64 = 0x10;

/// RFLAGS for fresh tasks: IF set, reserved bit 1 set.
const INITIAL_RFLAGS: u64 = 0x202;

/// Priority bands (0 is the most urgent).
pub const PRIORITY_HIGH: u8 = 63;
pub const PRIORITY_NORMAL: u8 = 127;
pub const PRIORITY_LOW: u8 = 191;
pub const PRIORITY_IDLE: u8 = 255;

/// Time slice in timer ticks per priority band (`priority >> 5`).
pub const QUANTUM_MS: [u16; 8] = [1, 5, 10, 20, 50, 75, 100, 200];

pub fn quantum_for(priority: u8) -> u16 {
    QUANTUM_MS[(priority >> 5) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Sleeping = 2,
    WaitingMsg = 3,
    Blocked = 4,
    Terminated = 5,
}

/// User levels; lower is more privileged.
pub const UID_KERNEL: u8 = 0;
pub const UID_ROOT: u8 = 1;
pub const UID_USER: u8 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        const KERNEL = 0x01;
        const SYSTEM = 0x02;
    }
}

/// Default capability mask by user level.
pub fn default_perm_mask(uid: u8) -> u32 {
    match uid {
        UID_KERNEL => 0xFFFF_FFFF,
        UID_ROOT => 0xFFFF_FFFE,
        _ => 0x0000_FFFF,
    }
}

pub type TaskEntry = extern "C" fn();

#[derive(Debug, Clone)]
pub struct Task {
    pub pid: u32,
    pub state: TaskState,
    pub uid: u8,
    pub gid: u8,
    pub priority: u8,
    pub flags: TaskFlags,
    pub quantum: u16,
    pub base_quantum: u16,
    pub sleep_expiry: u64,
    pub cpu_time: u64,
    pub start_time: u64,
    pub rsp: u64,
    pub cr3: u64,
    pub stack_base: u64,
    pub perm_mask: u32,
    /// Slot index of the next task in the circular list.
    pub next: usize,
}

impl Task {
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Check the canary word at the base of this task's stack. Tasks
    /// without their own stack (the boot/idle task) always pass.
    pub fn canary_intact(&self) -> bool {
        if self.stack_base == 0 {
            return true;
        }
        unsafe { core::ptr::read_volatile(self.stack_base as *const u64) == STACK_CANARY }
    }
}

/// Lay a fresh stack out for its first IRET dispatch: canary at the
/// bottom, interrupt-return frame at the top. Returns the initial
/// saved stack pointer.
///
/// # Safety
/// `stack_base` must point at `TASK_STACK_SIZE` writable bytes owned
/// by this task.
pub unsafe fn prepare_stack(stack_base: usize, entry: TaskEntry) -> u64 {
    core::ptr::write_volatile(stack_base as *mut u64, STACK_CANARY);

    let stack_top = stack_base + TASK_STACK_SIZE;
    let mut sp = stack_top as *mut u64;

    let mut push = |value: u64| unsafe {
        sp = sp.sub(1);
        core::ptr::write(sp, value);
    };

    // CPU interrupt frame, as IRET expects it.
    push(KERNEL_DS); // ss
    push(stack_top as u64 - 8); // rsp
    push(INITIAL_RFLAGS); // rflags, IF=1
    push(KERNEL_CS); // cs
    push(entry as usize as u64); // rip

    // Software part of the frame.
    push(0); // err_code
    push(0); // int_no
    for _ in 0..15 {
        push(0); // rax..r15
    }
    for _ in 0..4 {
        push(KERNEL_DS); // ds, es, fs, gs slots
    }

    sp as u64
}
