//! End-to-end scenarios over the public kernel API, run on the host.
//!
//! The hardware-independent core (buddy heap, message bus, capability
//! table, scheduler arena, syscall dispatch) behaves identically on
//! the host, so these flows mirror what the kernel does at runtime:
//! memory round trips, broadcast fan-out, and syscalls against the
//! live global state.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use corten_kernel::arch::x86_64::interrupts::InterruptFrame;
use corten_kernel::caps::CapTable;
use corten_kernel::ipc::{MessageBus, MessageType, MSG_QUEUE_SIZE};
use corten_kernel::memory::{self, BuddyHeap, HEADER_SIZE};
use corten_kernel::{sched, syscall};

struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn base(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// S1 + S2: allocator round trip and buddy coalescing through the
/// public heap type.
#[test]
fn allocator_scenarios() {
    let region = Region::new(1 << 20);
    let mut heap = unsafe { BuddyHeap::new(region.base(), 1 << 20) };

    // S1: interleaved alloc/free leaves the heap whole.
    let a = heap.alloc(100).unwrap();
    let b = heap.alloc(8000).unwrap();
    let c = heap.alloc(100).unwrap();
    heap.free(a);
    heap.free(c);
    heap.free(b);
    let stats = heap.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free, stats.total);
    assert!(heap.alloc((1 << 20) - HEADER_SIZE).is_some());

    // S2: freed neighbors coalesce; the merged block reuses the low
    // address.
    let region2 = Region::new(64 * 1024);
    let mut small = unsafe { BuddyHeap::new(region2.base(), 64 * 1024) };
    let a = small.alloc(4000).unwrap();
    let b = small.alloc(4000).unwrap();
    let x = a - HEADER_SIZE;
    assert_eq!(b - HEADER_SIZE, x + 4096);
    small.free(a);
    small.free(b);
    assert_eq!(small.alloc(8000).unwrap(), x + HEADER_SIZE);
}

/// S5: broadcast reaches every other active task, never the sender,
/// never task 0.
#[test]
fn broadcast_scenario() {
    let region = Region::new(2 << 20);
    let mut heap = unsafe { BuddyHeap::new(region.base(), 2 << 20) };
    let mut caps = CapTable::new();
    for task in 1..=3 {
        caps.create(task, 0, 0x0030).unwrap();
    }
    let mut bus = MessageBus::new();

    assert_eq!(bus.send(&mut heap, &caps, 1, 0, MessageType::Signal, b"hi"), 0);
    assert_eq!(bus.count(0), 0);
    assert_eq!(bus.count(1), 0);
    assert_eq!(bus.count(2), 1);
    assert_eq!(bus.count(3), 1);

    for task in [2usize, 3] {
        let mut buf = [0u8; 16];
        let header = bus.try_receive(&mut heap, task, &mut buf).unwrap();
        assert_eq!(header.sender_id, 1);
        assert_eq!(header.receiver_id, task as u32);
        assert_eq!(&buf[..2], b"hi");
    }
}

/// Queue-full behavior stays intact under the pointer-ring design.
#[test]
fn bounded_queue_scenario() {
    let region = Region::new(2 << 20);
    let mut heap = unsafe { BuddyHeap::new(region.base(), 2 << 20) };
    let caps = CapTable::new();
    let mut bus = MessageBus::new();

    for i in 0..MSG_QUEUE_SIZE {
        assert_eq!(
            bus.send(&mut heap, &caps, 0, 1, MessageType::Data, &[i as u8]),
            0
        );
    }
    assert_eq!(bus.send(&mut heap, &caps, 0, 1, MessageType::Data, b"x"), -1);

    let mut buf = [0u8; 4];
    for i in 0..MSG_QUEUE_SIZE {
        let header = bus.try_receive(&mut heap, 1, &mut buf).unwrap();
        assert_eq!(buf[0], i as u8, "message {i} corrupted");
        assert!(header.timestamp as usize == i + 1);
    }
}

fn syscall_frame(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> InterruptFrame {
    let mut frame: InterruptFrame = unsafe { core::mem::zeroed() };
    frame.int_no = 0x80;
    frame.rax = rax;
    frame.rdi = rdi;
    frame.rsi = rsi;
    frame.rdx = rdx;
    frame
}

/// S6 plus the syscall surface, against the real global kernel state:
/// heap installed, scheduler holding the idle task, dispatch driven
/// with fabricated `int 0x80` frames.
#[test]
fn syscall_scenarios() {
    // Commit a real heap region as the global kernel heap. Leaked on
    // purpose: global state lives for the whole process.
    let region = Box::leak(Box::new(Region::new(4 << 20)));
    unsafe { memory::heap::init(region.base(), 4 << 20) };
    sched::init();

    // S6: MEMINFO writes the same triple stats() reports.
    let (mut total, mut used, mut free) = (0u64, 0u64, 0u64);
    let mut frame = syscall_frame(
        syscall::SYS_MEMINFO,
        &mut total as *mut u64 as u64,
        &mut used as *mut u64 as u64,
        &mut free as *mut u64 as u64,
    );
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax, 0);
    let stats = memory::stats();
    assert_eq!(total, stats.total as u64);
    assert_eq!(used, stats.used as u64);
    assert_eq!(free, stats.free as u64);
    assert_eq!(used + free, total);

    // GETPID: the boot context is task 0.
    let mut frame = syscall_frame(syscall::SYS_GETPID, 0, 0, 0);
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax, 0);

    // MSGSND delivers an 8-byte payload; MSGRCV sees it pending.
    let mut frame = syscall_frame(syscall::SYS_MSGSND, 2, MessageType::Data as u64, 0xFEED);
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax, 0);
    let mut frame = syscall_frame(syscall::SYS_MSGRCV, 2, 0, 0);
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax, 1);

    // Unknown numbers are rejected with the sentinel.
    let mut frame = syscall_frame(4242, 0, 0, 0);
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax as i64, -1);

    // MEMINFO with a null pointer is rejected, not dereferenced.
    let mut frame = syscall_frame(syscall::SYS_MEMINFO, 0, 0, 0);
    syscall::dispatch(&mut frame);
    assert_eq!(frame.rax as i64, -1);
}
