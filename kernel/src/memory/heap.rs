//! Global kernel heap over the buddy allocator.
//!
//! `kmalloc`/`kfree` are the kernel-facing entry points; the same
//! heap backs `#[global_allocator]` so `alloc` collections and
//! `format!` work once `init` has run. Before that, allocation
//! returns null instead of faulting — the few early-boot paths that
//! could allocate all check for a live logger first.

use core::sync::atomic::{AtomicBool, Ordering};

use super::buddy::{BuddyHeap, HeapStats};
use crate::sync::IrqMutex;

static KHEAP: IrqMutex<Option<BuddyHeap>> = IrqMutex::new(None);
static HEAP_READY: AtomicBool = AtomicBool::new(false);

/// Install the buddy heap over `[start, start + size)`.
///
/// # Safety
/// The range must be writable memory owned exclusively by the heap.
pub unsafe fn init(start: usize, size: usize) {
    let mut guard = KHEAP.lock();
    if guard.is_some() {
        return;
    }
    *guard = Some(BuddyHeap::new(start, size));
    HEAP_READY.store(true, Ordering::SeqCst);
}

pub fn is_ready() -> bool {
    HEAP_READY.load(Ordering::SeqCst)
}

/// Allocate `size` bytes from the kernel heap.
pub fn kmalloc(size: usize) -> Option<usize> {
    KHEAP.lock().as_mut()?.alloc(size)
}

/// Return an allocation to the kernel heap.
pub fn kfree(addr: usize) {
    if let Some(heap) = KHEAP.lock().as_mut() {
        heap.free(addr);
    }
}

pub fn stats() -> HeapStats {
    match KHEAP.lock().as_ref() {
        Some(heap) => heap.stats(),
        None => HeapStats {
            total: 0,
            used: 0,
            free: 0,
        },
    }
}

/// Run a closure with the heap borrowed mutably; used by subsystems
/// that batch several allocator calls under one lock acquisition.
pub fn with_heap<R>(f: impl FnOnce(&mut BuddyHeap) -> R) -> Option<R> {
    KHEAP.lock().as_mut().map(f)
}

/// `GlobalAlloc` facade over the buddy heap.
pub struct KernelAllocator;

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator;

unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        // Buddy payloads are 16-byte aligned; larger alignments are
        // not served.
        if layout.align() > 16 || !HEAP_READY.load(Ordering::SeqCst) {
            return core::ptr::null_mut();
        }
        match kmalloc(layout.size()) {
            Some(addr) => addr as *mut u8,
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        if !ptr.is_null() {
            kfree(ptr as usize);
        }
    }
}
