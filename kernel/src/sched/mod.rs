//! Preemptive priority scheduler.
//!
//! The timer IRQ stub saves the full register frame on the running
//! task's stack and hands the resulting stack pointer to [`switch`];
//! whatever pointer comes back is reloaded before IRET. Cooperative
//! yields execute `int 32`, so both entry paths run the exact same
//! switch code.
//!
//! Selection: lowest numeric priority wins among READY/RUNNING
//! tasks; the incumbent keeps the CPU while its quantum lasts and
//! nothing strictly better is waiting. Sleeping tasks wake during the
//! scan once their expiry passes. The idle task (slot 0, priority
//! 255) is always runnable, so there is always a winner.

pub mod task;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::time::timer;
use crate::log::logger::try_get_logger;
use crate::memory::{heap, BuddyHeap};
use crate::sync::IrqMutex;

pub use task::{
    default_perm_mask, quantum_for, Task, TaskEntry, TaskFlags, TaskState, PRIORITY_HIGH,
    PRIORITY_IDLE, PRIORITY_LOW, PRIORITY_NORMAL, STACK_CANARY, TASK_STACK_SIZE, UID_KERNEL,
    UID_ROOT, UID_USER,
};

/// Arena size; also bounds task ids in the permission table and the
/// IPC queue table.
pub const MAX_TASKS: usize = 64;

/// A context switch found the canary word overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSmash {
    pub pid: u32,
}

pub struct Scheduler {
    slots: [Option<Task>; MAX_TASKS],
    current: usize,
    next_pid: u32,
    started: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        const NONE: Option<Task> = None;
        Self {
            slots: [NONE; MAX_TASKS],
            current: 0,
            next_pid: 0,
            started: false,
        }
    }

    /// Install the idle task in slot 0. The boot context *is* the
    /// idle task: it runs on the loader's stack (no canary) and ends
    /// up in a `hlt` loop once initialization finishes.
    pub fn init(&mut self, now: u64) {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.slots[0] = Some(Task {
            pid,
            state: TaskState::Running,
            uid: UID_KERNEL,
            gid: 0,
            priority: PRIORITY_IDLE,
            flags: TaskFlags::KERNEL,
            quantum: quantum_for(PRIORITY_IDLE),
            base_quantum: quantum_for(PRIORITY_IDLE),
            sleep_expiry: 0,
            cpu_time: 0,
            start_time: now,
            rsp: 0,
            cr3: 0,
            stack_base: 0,
            perm_mask: 0xFFFF_FFFF,
            next: 0,
        });
        self.current = 0;
        self.started = true;
    }

    fn task(&self, slot: usize) -> &Task {
        self.slots[slot].as_ref().expect("task slot live")
    }

    fn task_mut(&mut self, slot: usize) -> &mut Task {
        self.slots[slot].as_mut().expect("task slot live")
    }

    /// Append a slot to the circular list.
    fn list_add(&mut self, slot: usize) {
        let head = 0;
        let mut tail = head;
        while self.task(tail).next != head {
            tail = self.task(tail).next;
        }
        self.task_mut(tail).next = slot;
        self.task_mut(slot).next = head;
    }

    /// Create a task: TCB in the arena, 4 KiB stack from the buddy
    /// with canary + synthetic IRET frame, quantum from the priority
    /// band, permissions from the user level.
    pub fn create_full(
        &mut self,
        kernel_heap: &mut BuddyHeap,
        entry: TaskEntry,
        priority: u8,
        uid: u8,
        now: u64,
    ) -> Option<u32> {
        if !self.started {
            return None;
        }
        let slot = self.next_pid as usize;
        if slot >= MAX_TASKS {
            return None;
        }

        let stack_base = kernel_heap.alloc(TASK_STACK_SIZE)?;
        let rsp = unsafe { task::prepare_stack(stack_base, entry) };

        let pid = self.next_pid;
        self.next_pid += 1;

        let flags = match uid {
            UID_KERNEL => TaskFlags::KERNEL,
            UID_ROOT => TaskFlags::SYSTEM,
            _ => TaskFlags::empty(),
        };

        self.slots[slot] = Some(Task {
            pid,
            state: TaskState::Ready,
            uid,
            gid: uid,
            priority,
            flags,
            quantum: quantum_for(priority),
            base_quantum: quantum_for(priority),
            sleep_expiry: 0,
            cpu_time: 0,
            start_time: now,
            rsp,
            cr3: 0,
            stack_base: stack_base as u64,
            perm_mask: default_perm_mask(uid),
            next: slot,
        });
        self.list_add(slot);
        Some(pid)
    }

    /// The switch. Takes the interrupted task's saved stack pointer,
    /// returns the stack pointer to resume — the same one when the
    /// incumbent keeps the CPU.
    pub fn switch(&mut self, saved_rsp: u64, now: u64) -> Result<u64, StackSmash> {
        if !self.started {
            return Ok(saved_rsp);
        }

        let current = self.current;
        {
            let task = self.task_mut(current);
            task.rsp = saved_rsp;
            task.cpu_time += 1;
        }

        if !self.task(current).canary_intact() {
            return Err(StackSmash {
                pid: self.task(current).pid,
            });
        }

        if self.task(current).quantum > 0 {
            self.task_mut(current).quantum -= 1;
        }

        // One lap around the ring: wake expired sleepers, track the
        // best runnable candidate (lowest numeric priority).
        let start = self.task(current).next;
        let mut best: Option<usize> = None;
        let mut cursor = start;
        loop {
            {
                let task = self.task_mut(cursor);
                if task.state == TaskState::Sleeping && now >= task.sleep_expiry {
                    task.state = TaskState::Ready;
                    task.quantum = task.base_quantum;
                }
            }
            let task = self.task(cursor);
            if task.is_runnable() {
                let better = match best {
                    None => true,
                    Some(b) => task.priority < self.task(b).priority,
                };
                if better {
                    best = Some(cursor);
                }
            }
            cursor = task.next;
            if cursor == start {
                break;
            }
        }

        // The incumbent keeps the CPU while it is still running, has
        // quantum left, and nothing strictly more urgent showed up.
        let incumbent = self.task(current);
        let keeps = incumbent.state == TaskState::Running
            && incumbent.quantum > 0
            && best.map_or(true, |b| incumbent.priority <= self.task(b).priority);
        if keeps {
            return Ok(saved_rsp);
        }

        let winner = best.unwrap_or(current);
        if winner != current {
            if self.task(current).state == TaskState::Running {
                self.task_mut(current).state = TaskState::Ready;
            }
            self.current = winner;
            let task = self.task_mut(winner);
            task.state = TaskState::Running;
            task.quantum = task.base_quantum;
        }

        Ok(self.task(self.current).rsp)
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn current_pid(&self) -> u32 {
        if self.started {
            self.task(self.current).pid
        } else {
            0
        }
    }

    pub fn with_task<R>(&mut self, pid: u32, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|t| t.pid == pid)
            .map(f)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        if !self.started {
            return None;
        }
        let current = self.current;
        self.slots[current].as_mut()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().flatten()
    }
}

static SCHED: IrqMutex<Scheduler> = IrqMutex::new(Scheduler::new());

/// Reentrancy guard around the switch path.
static SCHED_LOCK: AtomicBool = AtomicBool::new(false);

pub fn init() {
    SCHED.lock().init(timer::pit_ticks());
    if let Some(logger) = try_get_logger() {
        logger.log("[sched] scheduler online (idle = pid 0)");
    }
}

pub fn create(entry: TaskEntry) -> Option<u32> {
    create_full(entry, PRIORITY_NORMAL, UID_USER)
}

pub fn create_with_priority(entry: TaskEntry, priority: u8) -> Option<u32> {
    create_full(entry, priority, UID_ROOT)
}

pub fn create_full(entry: TaskEntry, priority: u8, uid: u8) -> Option<u32> {
    let now = timer::pit_ticks();
    let pid = {
        let mut sched = SCHED.lock();
        heap::with_heap(|h| sched.create_full(h, entry, priority, uid, now))?
    };
    if let (Some(pid), Some(logger)) = (pid, try_get_logger()) {
        logger.log(&alloc::format!(
            "[sched] task {} created (priority {}, uid {})",
            pid,
            priority,
            uid
        ));
    }
    pid
}

/// Timer-IRQ entry: pick the stack pointer to resume. A broken canary
/// is fatal here and now.
pub fn switch(current_rsp: u64) -> u64 {
    if SCHED_LOCK.swap(true, Ordering::AcqRel) {
        return current_rsp;
    }
    let now = timer::pit_ticks();
    let result = SCHED.lock().switch(current_rsp, now);
    SCHED_LOCK.store(false, Ordering::Release);
    match result {
        Ok(rsp) => rsp,
        Err(_) => crate::panic::kernel_panic("Stack overflow"),
    }
}

/// Cooperative reschedule through the same vector the timer uses.
pub fn yield_now() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("int 32", options(nomem, nostack));
    }
}

/// Put the current task to sleep for at least `ms` timer ticks.
pub fn sleep(ms: u64) {
    {
        let now = timer::pit_ticks();
        let mut sched = SCHED.lock();
        if let Some(task) = sched.current_task_mut() {
            task.state = TaskState::Sleeping;
            task.sleep_expiry = now + ms;
        }
    }
    yield_now();
}

/// Terminate the current task. The slot is never selected again; its
/// stack and TCB stay allocated.
pub fn exit() -> ! {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
    {
        let mut sched = SCHED.lock();
        if let Some(task) = sched.current_task_mut() {
            task.state = TaskState::Terminated;
        }
    }
    // Interrupts are re-enabled by the IRET into the next task.
    loop {
        yield_now();
        crate::sync::wait_for_interrupt();
    }
}

pub fn current_pid() -> u32 {
    SCHED.lock().current_pid()
}

pub fn current_perm_mask() -> u32 {
    let mut sched = SCHED.lock();
    sched.current_task_mut().map_or(0, |t| t.perm_mask)
}

pub fn set_priority(pid: u32, priority: u8) -> bool {
    SCHED
        .lock()
        .with_task(pid, |t| {
            t.priority = priority;
            t.base_quantum = quantum_for(priority);
        })
        .is_some()
}

pub fn get_priority(pid: u32) -> Option<u8> {
    SCHED.lock().with_task(pid, |t| t.priority)
}

pub fn set_uid(pid: u32, uid: u8) -> bool {
    SCHED.lock().with_task(pid, |t| t.uid = uid).is_some()
}

pub fn get_uid(pid: u32) -> Option<u8> {
    SCHED.lock().with_task(pid, |t| t.uid)
}

/// Visit every live task (shell `ps`, diagnostics).
pub fn for_each_task(mut f: impl FnMut(&Task)) {
    let sched = SCHED.lock();
    for task in sched.tasks() {
        f(task);
    }
}

/// State + priority for the syscall surface.
pub fn task_info(pid: u32) -> Option<(u32, u8)> {
    SCHED
        .lock()
        .with_task(pid, |t| (t.state as u32, t.priority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buddy::BuddyHeap;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    extern "C" fn noop_entry() {}

    struct TestHeap {
        ptr: *mut u8,
        layout: Layout,
        heap: BuddyHeap,
    }

    impl TestHeap {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            let heap = unsafe { BuddyHeap::new(ptr as usize, size) };
            Self { ptr, layout, heap }
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn booted(now: u64) -> (Scheduler, TestHeap) {
        let mut sched = Scheduler::new();
        sched.init(now);
        (sched, TestHeap::new(1 << 20))
    }

    /// Drive `ticks` timer interrupts, feeding each returned stack
    /// pointer back in like the IRQ stub would.
    fn run_ticks(sched: &mut Scheduler, rsp: &mut u64, from: u64, ticks: u64) -> u64 {
        let mut now = from;
        for _ in 0..ticks {
            now += 1;
            *rsp = sched.switch(*rsp, now).unwrap();
        }
        now
    }

    #[test]
    fn idle_keeps_cpu_when_alone() {
        let (mut sched, _heap) = booted(0);
        let rsp = sched.switch(0x1000, 1).unwrap();
        assert_eq!(rsp, 0x1000);
        assert_eq!(sched.current_pid(), 0);
    }

    #[test]
    fn higher_priority_preempts_idle_and_shares_by_band() {
        let (mut sched, mut heap) = booted(0);
        let t1 = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_NORMAL, UID_USER, 0)
            .unwrap();
        let t2 = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_HIGH, UID_USER, 0)
            .unwrap();

        let mut rsp = 0x1000u64;
        // Let the first dispatch settle, then measure a clean window.
        let now = run_ticks(&mut sched, &mut rsp, 0, 2);
        let time = |pid: u32, s: &mut Scheduler| s.with_task(pid, |t| t.cpu_time).unwrap();
        let base = (time(t2, &mut sched), time(t1, &mut sched), time(0, &mut sched));

        run_ticks(&mut sched, &mut rsp, now, 500);
        let hi = time(t2, &mut sched) - base.0;
        let norm = time(t1, &mut sched) - base.1;
        let idle = time(0, &mut sched) - base.2;

        // Better bands accumulate at least as much time, and the best
        // priority dominates the whole window.
        assert!(hi >= norm, "high {hi} < normal {norm}");
        assert!(norm >= idle, "normal {norm} < idle {idle}");
        assert!(hi > 400, "high only ran {hi} of 500 ticks");
    }

    #[test]
    fn sleeping_task_wakes_after_expiry() {
        let (mut sched, mut heap) = booted(0);
        let pid = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_HIGH, UID_USER, 0)
            .unwrap();

        let mut rsp = 0x1000u64;
        // Let it get scheduled once.
        run_ticks(&mut sched, &mut rsp, 0, 1);
        assert_eq!(sched.current_pid(), pid);

        // Put it to sleep until tick 200.
        sched
            .with_task(pid, |t| {
                t.state = TaskState::Sleeping;
                t.sleep_expiry = 200;
            })
            .unwrap();

        let mut now = run_ticks(&mut sched, &mut rsp, 1, 100);
        // Well before expiry: not running, idle holds the CPU.
        assert_eq!(sched.current_pid(), 0);
        assert_eq!(
            sched.with_task(pid, |t| t.state).unwrap(),
            TaskState::Sleeping
        );

        now = run_ticks(&mut sched, &mut rsp, now, 100);
        assert!(now >= 200);
        // Woken and, as the best priority, running again.
        assert_eq!(sched.current_pid(), pid);
    }

    #[test]
    fn terminated_tasks_are_never_selected() {
        let (mut sched, mut heap) = booted(0);
        let pid = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_HIGH, UID_USER, 0)
            .unwrap();

        let mut rsp = 0x1000u64;
        run_ticks(&mut sched, &mut rsp, 0, 1);
        assert_eq!(sched.current_pid(), pid);

        sched
            .with_task(pid, |t| t.state = TaskState::Terminated)
            .unwrap();
        run_ticks(&mut sched, &mut rsp, 1, 50);
        assert_eq!(sched.current_pid(), 0);
    }

    #[test]
    fn canary_corruption_fails_the_switch() {
        let (mut sched, mut heap) = booted(0);
        let pid = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_HIGH, UID_USER, 0)
            .unwrap();

        let mut rsp = 0x1000u64;
        run_ticks(&mut sched, &mut rsp, 0, 1);
        assert_eq!(sched.current_pid(), pid);

        // Smash the canary of the now-current task.
        let stack_base = sched.with_task(pid, |t| t.stack_base).unwrap();
        unsafe { core::ptr::write_volatile(stack_base as *mut u64, 0) };

        assert_eq!(sched.switch(rsp, 2), Err(StackSmash { pid }));
    }

    #[test]
    fn quantum_expiry_rotates_within_a_band() {
        let (mut sched, mut heap) = booted(0);
        let a = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_NORMAL, UID_USER, 0)
            .unwrap();
        let b = sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_NORMAL, UID_USER, 0)
            .unwrap();

        let mut rsp = 0x1000u64;
        run_ticks(&mut sched, &mut rsp, 0, 400);

        let ta = sched.with_task(a, |t| t.cpu_time).unwrap();
        let tb = sched.with_task(b, |t| t.cpu_time).unwrap();
        // Same band: neither starves, and the split is roughly even.
        assert!(ta > 100 && tb > 100, "unfair split: {ta} vs {tb}");
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let (mut sched, mut heap) = booted(0);
        let mut created = 0;
        while sched
            .create_full(&mut heap.heap, noop_entry, PRIORITY_NORMAL, UID_USER, 0)
            .is_some()
        {
            created += 1;
        }
        // Slot 0 is the idle task.
        assert_eq!(created, MAX_TASKS - 1);
    }
}
