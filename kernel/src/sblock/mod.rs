//! Signed memory blocks.
//!
//! Reference-counted shared buffers for zero-copy IPC. Each block
//! carries a CRC32 signature over its payload and a small access
//! policy: the owner and the kernel always get in, everyone else
//! needs the matching permission bit, and KERNEL-flagged blocks are
//! limited to root and below.

use bitflags::bitflags;
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::memory::BuddyHeap;
use crate::sched::{UID_KERNEL, UID_ROOT};

/// "SBLKSIGN" in block headers.
pub const SBLOCK_MAGIC: u64 = u64::from_le_bytes(*b"SBLKSIGN");

/// Largest signed block payload.
pub const SBLOCK_MAX_SIZE: usize = 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SblockPerms: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const EXEC  = 0x04;
        const SHARE = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SblockFlags: u8 {
        const VALID  = 0x01;
        const LOCKED = 0x02;
        const KERNEL = 0x04;
    }
}

/// Block header; the payload follows in memory.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SblockHeader {
    pub magic: u64,
    pub signature: u32,
    pub size: u32,
    pub owner_uid: u8,
    pub permissions: u8,
    pub flags: u8,
    pub ref_count: u8,
    _reserved: u32,
}

pub const SBLOCK_HEADER_SIZE: usize = core::mem::size_of::<SblockHeader>();

#[inline]
fn header_mut(block: usize) -> *mut SblockHeader {
    block as *mut SblockHeader
}

#[inline]
fn data_ptr(block: usize) -> *mut u8 {
    (block + SBLOCK_HEADER_SIZE) as *mut u8
}

fn is_valid(block: usize) -> bool {
    block != 0 && unsafe { (*header_mut(block)).magic } == SBLOCK_MAGIC
}

/// Allocate a signed block. `ref_count` starts at 1; the signature is
/// zero until [`sign`] runs.
pub fn alloc(
    heap: &mut BuddyHeap,
    size: usize,
    owner_uid: u8,
    perms: SblockPerms,
) -> Option<usize> {
    if size == 0 || size > SBLOCK_MAX_SIZE {
        return None;
    }
    let block = heap.alloc(SBLOCK_HEADER_SIZE + size)?;
    unsafe {
        core::ptr::write_bytes(block as *mut u8, 0, SBLOCK_HEADER_SIZE + size);
        header_mut(block).write(SblockHeader {
            magic: SBLOCK_MAGIC,
            signature: 0,
            size: size as u32,
            owner_uid,
            permissions: perms.bits(),
            flags: SblockFlags::VALID.bits(),
            ref_count: 1,
            _reserved: 0,
        });
    }
    Some(block)
}

/// Recompute the payload CRC32 into the header.
pub fn sign(block: usize) {
    if !is_valid(block) {
        return;
    }
    unsafe {
        let header = &mut *header_mut(block);
        let data = core::slice::from_raw_parts(data_ptr(block), header.size as usize);
        header.signature = CRC32.checksum(data);
    }
}

/// Re-run the CRC and compare against the stored signature.
pub fn verify(block: usize) -> bool {
    if !is_valid(block) {
        return false;
    }
    unsafe {
        let header = &*header_mut(block);
        if header.flags & SblockFlags::VALID.bits() == 0 {
            return false;
        }
        let data = core::slice::from_raw_parts(data_ptr(block), header.size as usize);
        CRC32.checksum(data) == header.signature
    }
}

/// Data pointer iff `uid` may touch the block with permission `perm`.
pub fn access(block: usize, uid: u8, perm: SblockPerms) -> Option<usize> {
    if !is_valid(block) {
        return None;
    }
    let header = unsafe { &*header_mut(block) };
    if header.flags & SblockFlags::VALID.bits() == 0 {
        return None;
    }

    // Owner and kernel bypass the permission bits.
    if uid != header.owner_uid && uid != UID_KERNEL {
        if header.permissions & perm.bits() != perm.bits() {
            return None;
        }
        if header.flags & SblockFlags::KERNEL.bits() != 0 && uid > UID_ROOT {
            return None;
        }
    }

    Some(block + SBLOCK_HEADER_SIZE)
}

/// Take another reference for `target_uid`. Requires the SHARE bit;
/// KERNEL-flagged blocks only share down to root.
pub fn share(block: usize, target_uid: u8) -> Result<(), &'static str> {
    if !is_valid(block) {
        return Err("not a signed block");
    }
    let header = unsafe { &mut *header_mut(block) };
    if header.permissions & SblockPerms::SHARE.bits() == 0 {
        return Err("block is not shareable");
    }
    if header.flags & SblockFlags::KERNEL.bits() != 0 && target_uid > UID_ROOT {
        return Err("kernel block requires root");
    }
    if header.ref_count == u8::MAX {
        return Err("reference count saturated");
    }
    header.ref_count += 1;
    Ok(())
}

/// Drop one reference; the last one invalidates the header and hands
/// the memory back to the buddy.
pub fn free(heap: &mut BuddyHeap, block: usize) {
    if !is_valid(block) {
        return;
    }
    let header = unsafe { &mut *header_mut(block) };
    if header.ref_count > 0 {
        header.ref_count -= 1;
    }
    if header.ref_count == 0 {
        header.magic = 0;
        heap.free(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buddy::BuddyHeap;
    use crate::sched::UID_USER;
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

    #[test]
    fn sign_and_verify() {
        let mut th = TestHeap::new(1 << 20);
        let block = alloc(&mut th.heap, 128, UID_ROOT, SblockPerms::READ).unwrap();

        let data = access(block, UID_ROOT, SblockPerms::READ).unwrap();
        unsafe { core::ptr::write_bytes(data as *mut u8, 0xAB, 128) };
        sign(block);
        assert!(verify(block));

        // Any payload change breaks the signature.
        unsafe { *(data as *mut u8) = 0xCD };
        assert!(!verify(block));
        sign(block);
        assert!(verify(block));
    }

    #[test]
    fn crc_matches_reference_vector() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(CRC32.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn access_policy() {
        let mut th = TestHeap::new(1 << 20);
        let block = alloc(&mut th.heap, 64, UID_ROOT, SblockPerms::READ).unwrap();

        // Owner and kernel always get in.
        assert!(access(block, UID_ROOT, SblockPerms::WRITE).is_some());
        assert!(access(block, UID_KERNEL, SblockPerms::WRITE).is_some());

        // Others need the matching bit.
        assert!(access(block, UID_USER, SblockPerms::READ).is_some());
        assert!(access(block, UID_USER, SblockPerms::WRITE).is_none());
    }

    #[test]
    fn kernel_flagged_blocks_are_root_only() {
        let mut th = TestHeap::new(1 << 20);
        let block = alloc(
            &mut th.heap,
            64,
            UID_KERNEL,
            SblockPerms::READ | SblockPerms::SHARE,
        )
        .unwrap();
        unsafe {
            (*header_mut(block)).flags |= SblockFlags::KERNEL.bits();
        }

        assert!(access(block, UID_ROOT, SblockPerms::READ).is_some());
        assert!(access(block, UID_USER, SblockPerms::READ).is_none());

        assert!(share(block, UID_ROOT).is_ok());
        assert!(share(block, UID_USER).is_err());
    }

    #[test]
    fn share_and_free_are_refcounted() {
        let mut th = TestHeap::new(1 << 20);
        let block = alloc(&mut th.heap, 64, UID_ROOT, SblockPerms::SHARE).unwrap();
        share(block, UID_USER).unwrap();

        let used = th.heap.stats().used;
        free(&mut th.heap, block);
        // One reference left: still allocated and valid.
        assert_eq!(th.heap.stats().used, used);
        assert!(is_valid(block));

        free(&mut th.heap, block);
        assert_eq!(th.heap.stats().used, 0);
        assert!(!is_valid(block));
    }

    #[test]
    fn share_requires_share_bit_and_caps_at_255() {
        let mut th = TestHeap::new(1 << 20);
        let sealed = alloc(&mut th.heap, 64, UID_ROOT, SblockPerms::READ).unwrap();
        assert!(share(sealed, UID_USER).is_err());

        let shared = alloc(&mut th.heap, 64, UID_ROOT, SblockPerms::SHARE).unwrap();
        for _ in 0..254 {
            share(shared, UID_USER).unwrap();
        }
        // ref_count is now 255.
        assert!(share(shared, UID_USER).is_err());
    }
}
