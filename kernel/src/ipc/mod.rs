//! Inter-task messaging.
//!
//! Each receiver owns a bounded ring of envelope pointers, allocated
//! lazily on first use. Send classifies the payload into a slab
//! class, fills an envelope and enqueues its address; a full ring
//! rejects the message and the envelope goes straight back to the
//! pool. Receive drains in FIFO order and recycles the envelope.
//!
//! Receiver id 0 broadcasts: the message fans out to every other
//! active task, skipping the sender and task 0 itself.
//!
//! Blocking receive deliberately stays a halt-and-recheck loop — the
//! scheduler never learns the task is waiting; any interrupt wakes
//! the loop for another look.

pub mod message;

pub use message::{
    class_for, MessageHeader, MessageType, PointerPayload, SlabPool, MSG_MAX_SIZE, SLAB_CLASSES,
};

use message::{header_ptr, payload_ptr};

use crate::caps::CapTable;
use crate::memory::{heap, BuddyHeap};
use crate::sched::MAX_TASKS;
use crate::sync::IrqMutex;

/// Capacity of each receiver's ring.
pub const MSG_QUEUE_SIZE: usize = 64;

#[repr(C)]
struct MsgQueue {
    slots: [usize; MSG_QUEUE_SIZE],
    read_pos: u32,
    write_pos: u32,
    count: u32,
}

pub struct MessageBus {
    /// Envelope-ring address per task id; 0 = not yet created.
    queues: [usize; MAX_TASKS],
    pool: SlabPool,
    /// Monotonic send counter, stamped into every envelope.
    sequence: u64,
}

impl MessageBus {
    pub const fn new() -> Self {
        Self {
            queues: [0; MAX_TASKS],
            pool: SlabPool::new(),
            sequence: 0,
        }
    }

    fn queue(&mut self, heap: &mut BuddyHeap, task_id: usize) -> Option<*mut MsgQueue> {
        if task_id >= MAX_TASKS {
            return None;
        }
        if self.queues[task_id] == 0 {
            let addr = heap.alloc(core::mem::size_of::<MsgQueue>())?;
            unsafe {
                (addr as *mut MsgQueue).write(MsgQueue {
                    slots: [0; MSG_QUEUE_SIZE],
                    read_pos: 0,
                    write_pos: 0,
                    count: 0,
                });
            }
            self.queues[task_id] = addr;
        }
        Some(self.queues[task_id] as *mut MsgQueue)
    }

    /// Existing queue only; never allocates.
    fn peek_queue(&self, task_id: usize) -> Option<*mut MsgQueue> {
        if task_id >= MAX_TASKS || self.queues[task_id] == 0 {
            return None;
        }
        Some(self.queues[task_id] as *mut MsgQueue)
    }

    /// Send `data` to `receiver`; 0 broadcasts. Returns 0 on success,
    /// -1 on any rejection (sentinel contract shared with the syscall
    /// layer).
    pub fn send(
        &mut self,
        heap: &mut BuddyHeap,
        caps: &CapTable,
        sender: usize,
        receiver: usize,
        msg_type: MessageType,
        data: &[u8],
    ) -> i32 {
        if sender >= MAX_TASKS || receiver >= MAX_TASKS {
            return -1;
        }
        if data.len() > MSG_MAX_SIZE {
            return -1;
        }

        if receiver == 0 {
            // Broadcast: every other active task, never the sender,
            // never task 0.
            let mut delivered = 0;
            for target in 1..MAX_TASKS {
                if target == sender || !caps.is_active(target) {
                    continue;
                }
                if self.deliver(heap, sender, target, msg_type, data) == 0 {
                    delivered += 1;
                }
            }
            return if delivered > 0 { 0 } else { -1 };
        }

        self.deliver(heap, sender, receiver, msg_type, data)
    }

    fn deliver(
        &mut self,
        heap: &mut BuddyHeap,
        sender: usize,
        receiver: usize,
        msg_type: MessageType,
        data: &[u8],
    ) -> i32 {
        let class = match class_for(data.len()) {
            Some(class) => class,
            None => return -1,
        };
        let envelope = match self.pool.alloc(heap, class) {
            Some(envelope) => envelope,
            None => return -1,
        };

        self.sequence += 1;
        unsafe {
            header_ptr(envelope).write(MessageHeader {
                sender_id: sender as u32,
                receiver_id: receiver as u32,
                msg_type: msg_type as u32,
                size: data.len() as u32,
                slab_class: class as u32,
                flags: 0,
                timestamp: self.sequence,
            });
            core::ptr::copy_nonoverlapping(data.as_ptr(), payload_ptr(envelope), data.len());
        }

        let queue = match self.queue(heap, receiver) {
            Some(queue) => queue,
            None => {
                self.pool.free(envelope);
                return -1;
            }
        };

        unsafe {
            if (*queue).count as usize >= MSG_QUEUE_SIZE {
                self.pool.free(envelope);
                return -1;
            }
            let write = (*queue).write_pos as usize;
            (*queue).slots[write] = envelope;
            (*queue).write_pos = ((write + 1) % MSG_QUEUE_SIZE) as u32;
            (*queue).count += 1;
        }
        0
    }

    /// Non-blocking receive: pop the oldest envelope, copy out up to
    /// `buf.len()` payload bytes, recycle the envelope.
    pub fn try_receive(
        &mut self,
        heap: &mut BuddyHeap,
        receiver: usize,
        buf: &mut [u8],
    ) -> Option<MessageHeader> {
        let queue = self.queue(heap, receiver)?;
        let envelope = unsafe {
            if (*queue).count == 0 {
                return None;
            }
            let read = (*queue).read_pos as usize;
            let envelope = (*queue).slots[read];
            (*queue).read_pos = ((read + 1) % MSG_QUEUE_SIZE) as u32;
            (*queue).count -= 1;
            envelope
        };

        let header = unsafe { *header_ptr(envelope) };
        let copy_len = (header.size as usize).min(buf.len());
        unsafe {
            core::ptr::copy_nonoverlapping(payload_ptr(envelope), buf.as_mut_ptr(), copy_len);
        }
        self.pool.free(envelope);
        Some(header)
    }

    pub fn available(&self, receiver: usize) -> bool {
        self.count(receiver) > 0
    }

    pub fn count(&self, receiver: usize) -> u32 {
        match self.peek_queue(receiver) {
            Some(queue) => unsafe { (*queue).count },
            None => 0,
        }
    }

    /// Drop every queued message, returning all envelopes to the pool.
    pub fn clear(&mut self, receiver: usize) {
        let queue = match self.peek_queue(receiver) {
            Some(queue) => queue,
            None => return,
        };
        unsafe {
            while (*queue).count > 0 {
                let read = (*queue).read_pos as usize;
                let envelope = (*queue).slots[read];
                (*queue).read_pos = ((read + 1) % MSG_QUEUE_SIZE) as u32;
                (*queue).count -= 1;
                self.pool.free(envelope);
            }
            (*queue).read_pos = 0;
            (*queue).write_pos = 0;
        }
    }

    pub fn pooled(&self, class: usize) -> usize {
        self.pool.pooled(class)
    }
}

static BUS: IrqMutex<MessageBus> = IrqMutex::new(MessageBus::new());

pub fn init() {
    *BUS.lock() = MessageBus::new();
}

/// Kernel-facing send; 0 on success, -1 on rejection.
pub fn send(sender: usize, receiver: usize, msg_type: MessageType, data: &[u8]) -> i32 {
    let caps = crate::caps::snapshot();
    let mut bus = BUS.lock();
    heap::with_heap(|h| bus.send(h, &caps, sender, receiver, msg_type, data)).unwrap_or(-1)
}

/// Zero-copy variant: ships a pointer + length descriptor.
pub fn send_ptr(sender: usize, receiver: usize, addr: usize, len: usize) -> i32 {
    let descriptor = PointerPayload {
        addr: addr as u64,
        len: len as u64,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &descriptor as *const PointerPayload as *const u8,
            core::mem::size_of::<PointerPayload>(),
        )
    };
    send(sender, receiver, MessageType::Pointer, bytes)
}

/// Blocking receive: halt until a message shows up.
pub fn receive(receiver: usize, buf: &mut [u8]) -> Option<MessageHeader> {
    loop {
        {
            let mut bus = BUS.lock();
            if let Some(header) = heap::with_heap(|h| bus.try_receive(h, receiver, buf)).flatten()
            {
                return Some(header);
            }
        }
        crate::sync::wait_for_interrupt();
    }
}

pub fn try_receive(receiver: usize, buf: &mut [u8]) -> Option<MessageHeader> {
    let mut bus = BUS.lock();
    heap::with_heap(|h| bus.try_receive(h, receiver, buf)).flatten()
}

pub fn available(receiver: usize) -> bool {
    BUS.lock().available(receiver)
}

pub fn count(receiver: usize) -> u32 {
    BUS.lock().count(receiver)
}

pub fn clear(receiver: usize) {
    BUS.lock().clear(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::CapTable;
    use crate::memory::buddy::BuddyHeap;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

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

    fn caps_with_tasks(ids: &[usize]) -> CapTable {
        let mut caps = CapTable::new();
        for &id in ids {
            caps.create(id, 0, 0x0030).unwrap(); // MSG_SEND | MSG_RECEIVE
        }
        caps
    }

    #[test]
    fn send_receive_round_trip() {
        let mut th = TestHeap::new(1 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        assert_eq!(
            bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, b"hello"),
            0
        );
        let mut buf = [0u8; 64];
        let header = bus.try_receive(&mut th.heap, 2, &mut buf).unwrap();
        assert_eq!(header.sender_id, 1);
        assert_eq!(header.receiver_id, 2);
        assert_eq!(header.msg_type, MessageType::Data as u32);
        assert_eq!(header.size, 5);
        assert_eq!(&buf[..5], b"hello");

        // Empty again.
        assert!(bus.try_receive(&mut th.heap, 2, &mut buf).is_none());
    }

    #[test]
    fn timestamps_are_monotonic_per_receiver() {
        let mut th = TestHeap::new(1 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        for i in 0..10u8 {
            assert_eq!(
                bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, &[i]),
                0
            );
        }
        let mut last = 0;
        let mut buf = [0u8; 16];
        while let Some(header) = bus.try_receive(&mut th.heap, 2, &mut buf) {
            assert!(header.timestamp > last);
            last = header.timestamp;
        }
    }

    #[test]
    fn full_queue_rejects_without_corruption() {
        let mut th = TestHeap::new(2 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        for i in 0..MSG_QUEUE_SIZE {
            assert_eq!(
                bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, &[i as u8]),
                0
            );
        }
        assert_eq!(bus.count(2), MSG_QUEUE_SIZE as u32);

        // 65th message bounces; the envelope goes straight back.
        let pooled_before = bus.pooled(0);
        assert_eq!(
            bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, b"x"),
            -1
        );
        assert_eq!(bus.pooled(0), pooled_before + 1);

        // Every queued message is intact and in order.
        let mut buf = [0u8; 16];
        for i in 0..MSG_QUEUE_SIZE {
            let header = bus.try_receive(&mut th.heap, 2, &mut buf).unwrap();
            assert_eq!(header.size, 1);
            assert_eq!(buf[0], i as u8);
        }
    }

    #[test]
    fn oversize_and_bad_ids_are_rejected() {
        let mut th = TestHeap::new(1 << 20);
        let caps = caps_with_tasks(&[1]);
        let mut bus = MessageBus::new();

        let big = vec![0u8; MSG_MAX_SIZE + 1];
        assert_eq!(bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, &big), -1);
        assert_eq!(
            bus.send(&mut th.heap, &caps, MAX_TASKS, 2, MessageType::Data, b"x"),
            -1
        );
        assert_eq!(
            bus.send(&mut th.heap, &caps, 1, MAX_TASKS, MessageType::Data, b"x"),
            -1
        );
    }

    #[test]
    fn broadcast_skips_sender_and_task_zero() {
        // S5: tasks 1,2,3 active; task 1 broadcasts; 2 and 3 each see
        // one message, 0 and 1 see none.
        let mut th = TestHeap::new(2 << 20);
        let caps = caps_with_tasks(&[1, 2, 3]);
        let mut bus = MessageBus::new();

        assert_eq!(
            bus.send(&mut th.heap, &caps, 1, 0, MessageType::Signal, b"hi"),
            0
        );
        assert_eq!(bus.count(0), 0);
        assert_eq!(bus.count(1), 0);
        assert_eq!(bus.count(2), 1);
        assert_eq!(bus.count(3), 1);

        let mut buf = [0u8; 16];
        let header = bus.try_receive(&mut th.heap, 2, &mut buf).unwrap();
        assert_eq!(header.msg_type, MessageType::Signal as u32);
        assert_eq!(&buf[..2], b"hi");

        // Broadcast with no other active task fails.
        let lonely = caps_with_tasks(&[5]);
        let mut solo = MessageBus::new();
        assert_eq!(
            solo.send(&mut th.heap, &lonely, 5, 0, MessageType::Signal, b"hi"),
            -1
        );
    }

    #[test]
    fn clear_returns_envelopes_to_pool() {
        let mut th = TestHeap::new(2 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        for _ in 0..7 {
            bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, &[0u8; 100]);
        }
        assert_eq!(bus.count(2), 7);
        let pooled_before = bus.pooled(2); // class 2 = 256-byte payloads

        bus.clear(2);
        assert_eq!(bus.count(2), 0);
        assert_eq!(bus.pooled(2), pooled_before + 7);
    }

    #[test]
    fn slab_reuse_is_lifo() {
        let mut th = TestHeap::new(1 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, b"a");
        let mut buf = [0u8; 16];
        bus.try_receive(&mut th.heap, 2, &mut buf).unwrap();
        let used_before = th.heap.stats().used;

        // The next same-class send reuses the pooled envelope: no new
        // buddy allocation.
        bus.send(&mut th.heap, &caps, 1, 2, MessageType::Data, b"b");
        assert_eq!(th.heap.stats().used, used_before);
        assert_eq!(bus.pooled(0), 0);
    }

    #[test]
    fn pointer_payload_round_trips() {
        let mut th = TestHeap::new(1 << 20);
        let caps = caps_with_tasks(&[1, 2]);
        let mut bus = MessageBus::new();

        let descriptor = PointerPayload {
            addr: 0xDEAD_0000,
            len: 512,
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &descriptor as *const PointerPayload as *const u8,
                core::mem::size_of::<PointerPayload>(),
            )
        };
        bus.send(&mut th.heap, &caps, 1, 2, MessageType::Pointer, bytes);

        let mut buf = [0u8; 16];
        let header = bus.try_receive(&mut th.heap, 2, &mut buf).unwrap();
        assert_eq!(header.msg_type, MessageType::Pointer as u32);
        let got: PointerPayload = unsafe { core::ptr::read(buf.as_ptr() as *const _) };
        assert_eq!(got.addr, 0xDEAD_0000);
        assert_eq!(got.len, 512);
    }
}
