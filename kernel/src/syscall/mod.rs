//! System call dispatcher (POSIX-inspired numbers, `int 0x80`).
//!
//! The entry stub hands over the saved register frame: `rax` is the
//! syscall number, `rdi`/`rsi`/`rdx` up to three arguments, and the
//! result lands back in the frame's `rax` slot. Message syscalls
//! check the caller's capability mask; everything else is open to
//! any task.

use crate::arch::x86_64::interrupts::InterruptFrame;
use crate::arch::x86_64::time::timer;
use crate::arch::x86_64::{keyboard, vga};
use crate::ipc::{self, MessageType};
use crate::log::logger::try_get_logger;
use crate::memory;
use crate::sched;

pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_GETPID: u64 = 20;
pub const SYS_YIELD: u64 = 24;
pub const SYS_SLEEP: u64 = 35;
pub const SYS_EXIT: u64 = 60;
pub const SYS_MSGSND: u64 = 71;
pub const SYS_MSGRCV: u64 = 72;
pub const SYS_UPTIME_MS: u64 = 96;
pub const SYS_MEMINFO: u64 = 97;
pub const SYS_TASKINFO: u64 = 98;
pub const SYS_GETTIME_NS: u64 = 99;
pub const SYS_GETFREQ: u64 = 100;

/// Capability bits mirrored from the task permission masks.
const PERM_MSG_SEND: u32 = 0x0010;
const PERM_MSG_RECEIVE: u32 = 0x0020;

pub fn init() {
    if let Some(logger) = try_get_logger() {
        logger.log("[sys] syscall gate armed (int 0x80)");
    }
}

/// Main dispatcher, called with the saved frame of the interrupted
/// task.
pub fn dispatch(frame: &mut InterruptFrame) {
    let number = frame.rax;
    let a1 = frame.rdi;
    let a2 = frame.rsi;
    let a3 = frame.rdx;

    let ret: i64 = match number {
        SYS_READ => sys_read(a2 as *mut u8, a3 as usize),
        SYS_WRITE => sys_write(a2 as *const u8, a3 as usize),
        SYS_GETPID => sched::current_pid() as i64,
        SYS_YIELD => {
            sched::yield_now();
            0
        }
        SYS_SLEEP => {
            sched::sleep(a1);
            0
        }
        SYS_EXIT => sched::exit(),
        SYS_MSGSND => sys_msgsnd(a1 as usize, a2 as u32, a3),
        SYS_MSGRCV => sys_msgrcv(a1 as usize),
        SYS_UPTIME_MS => timer::ms() as i64,
        SYS_MEMINFO => sys_meminfo(a1 as *mut u64, a2 as *mut u64, a3 as *mut u64),
        SYS_TASKINFO => sys_taskinfo(a1 as u32, a2 as *mut u32, a3 as *mut u8),
        SYS_GETTIME_NS => timer::ns() as i64,
        SYS_GETFREQ => timer::frequency_hz() as i64,
        _ => -1,
    };

    frame.rax = ret as u64;
}

fn sys_read(buf: *mut u8, _len: usize) -> i64 {
    if buf.is_null() {
        return -1;
    }
    match keyboard::try_getchar() {
        Some(ch) => {
            unsafe { buf.write(ch) };
            1
        }
        None => 0,
    }
}

fn sys_write(buf: *const u8, len: usize) -> i64 {
    if buf.is_null() {
        return -1;
    }
    let bytes = unsafe { core::slice::from_raw_parts(buf, len) };
    match core::str::from_utf8(bytes) {
        Ok(s) => {
            vga::print(s);
            0
        }
        Err(_) => -1,
    }
}

fn sys_msgsnd(dest: usize, raw_type: u32, data: u64) -> i64 {
    if sched::current_perm_mask() & PERM_MSG_SEND == 0 {
        return -1;
    }
    let msg_type = match MessageType::from_raw(raw_type) {
        Some(t) => t,
        None => return -1,
    };
    ipc::send(
        sched::current_pid() as usize,
        dest,
        msg_type,
        &data.to_le_bytes(),
    ) as i64
}

fn sys_msgrcv(task_id: usize) -> i64 {
    if sched::current_perm_mask() & PERM_MSG_RECEIVE == 0 {
        return -1;
    }
    ipc::available(task_id) as i64
}

fn sys_meminfo(total: *mut u64, used: *mut u64, free: *mut u64) -> i64 {
    if total.is_null() || used.is_null() || free.is_null() {
        return -1;
    }
    let stats = memory::stats();
    unsafe {
        total.write(stats.total as u64);
        used.write(stats.used as u64);
        free.write(stats.free as u64);
    }
    0
}

fn sys_taskinfo(pid: u32, state: *mut u32, priority: *mut u8) -> i64 {
    match sched::task_info(pid) {
        Some((task_state, task_priority)) => {
            if !state.is_null() {
                unsafe { state.write(task_state) };
            }
            if !priority.is_null() {
                unsafe { priority.write(task_priority) };
            }
            0
        }
        None => -1,
    }
}
