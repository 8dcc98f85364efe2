//! DMA memory management.
//!
//! All hardware-visible structures (descriptors, frame lists, transfer
//! buffers) are carved out of a single pool the embedder hands over at
//! startup. The controllers only ever see 32-bit physical addresses, so the
//! pool must live below 4 GiB and be physically contiguous; translation
//! between the CPU view and the bus view is a fixed offset.
//!
//! Descriptors are reached through typed pointers borrowed from a
//! [`DmaBuffer`], never through raw physical addresses, so unlinking a
//! structure from a hardware schedule cannot leave the software side with a
//! dangling reference.

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::error::{Result, UsbError};

struct Pool {
    heap: Heap,
    base_va: usize,
    base_phys: u32,
    size: usize,
}

static POOL: Mutex<Option<Pool>> = Mutex::new(None);

/// Hand a DMA-capable memory region to the driver stack.
///
/// `phys_base` is the bus address of the first byte of `region`. On the
/// identity-mapped platforms this stack targets, that is simply the region's
/// own address.
///
/// # Safety
///
/// The region must be valid, unused by anyone else, physically contiguous
/// and reachable by 32-bit bus-master DMA for its whole `size`.
pub unsafe fn init(region: *mut u8, size: usize, phys_base: u32) {
    let mut pool = POOL.lock();
    let mut heap = Heap::empty();
    heap.init(region, size);
    *pool = Some(Pool {
        heap,
        base_va: region as usize,
        base_phys: phys_base,
        size,
    });
}

#[cfg(test)]
pub(crate) fn ensure_test_pool() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        const TEST_POOL_SIZE: usize = 4 << 20;
        let region = Box::leak(vec![0u8; TEST_POOL_SIZE].into_boxed_slice());
        unsafe { init(region.as_mut_ptr(), TEST_POOL_SIZE, 0x0010_0000) };
    });
}

/// Translate a physical address written by the hardware back to a pointer.
///
/// Returns null for addresses outside the pool (e.g. terminated link
/// pointers).
pub fn phys_to_virt(phys: u32) -> *mut u8 {
    let pool = POOL.lock();
    match pool.as_ref() {
        Some(p) if phys >= p.base_phys && ((phys - p.base_phys) as usize) < p.size => {
            (p.base_va + (phys - p.base_phys) as usize) as *mut u8
        }
        _ => core::ptr::null_mut(),
    }
}

fn virt_to_phys(va: usize) -> u32 {
    let pool = POOL.lock();
    let p = pool.as_ref().expect("DMA pool not initialized");
    debug_assert!(va >= p.base_va && va - p.base_va < p.size);
    p.base_phys + (va - p.base_va) as u32
}

/// An owned, aligned allocation in the DMA pool.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is plain memory shared with the device; access discipline is
// the caller's responsibility (active-flag protocol).
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `size` bytes aligned to `align`, zero-filled.
    pub fn alloc(size: usize, align: usize) -> Result<DmaBuffer> {
        #[cfg(test)]
        ensure_test_pool();

        let layout = Layout::from_size_align(size.max(1), align.max(1))
            .map_err(|_| UsbError::BadArgument)?;
        let ptr = {
            let mut pool = POOL.lock();
            let pool = pool.as_mut().ok_or(UsbError::NoMemory)?;
            pool.heap
                .allocate_first_fit(layout)
                .map_err(|_| UsbError::NoMemory)?
        };
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(DmaBuffer { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bus address of the first byte.
    pub fn phys(&self) -> u32 {
        virt_to_phys(self.ptr.as_ptr() as usize)
    }

    /// Bus address of a location inside this buffer.
    pub fn phys_of<T>(&self, inner: *const T) -> u32 {
        let va = inner as usize;
        debug_assert!(
            va >= self.ptr.as_ptr() as usize && va < self.ptr.as_ptr() as usize + self.len()
        );
        virt_to_phys(va)
    }

    /// View the buffer as bytes. Only valid while no transfer is active on
    /// it; the hardware owns the contents in between.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len())
    }

    /// Mutable view, same ownership caveat as [`DmaBuffer::as_slice`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut pool = POOL.lock();
        if let Some(pool) = pool.as_mut() {
            unsafe { pool.heap.deallocate(self.ptr, self.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        for align in [16usize, 32, 256, 4096] {
            let buf = DmaBuffer::alloc(64, align).unwrap();
            assert_eq!(buf.as_ptr() as usize % align, 0);
            assert_eq!(buf.phys() as usize % align, 0);
        }
    }

    #[test]
    fn phys_translation_round_trips() {
        let buf = DmaBuffer::alloc(128, 32).unwrap();
        let phys = buf.phys();
        assert_eq!(phys_to_virt(phys), buf.as_mut_ptr());
        let inner = unsafe { buf.as_ptr().add(48) };
        assert_eq!(buf.phys_of(inner), phys + 48);
    }

    #[test]
    fn buffers_are_zeroed_and_freed() {
        let first = DmaBuffer::alloc(256, 16).unwrap();
        unsafe { first.as_mut_slice().fill(0xaa) };
        let addr = first.as_ptr() as usize;
        drop(first);
        // The allocator may reuse the block; a fresh allocation is zeroed
        // either way.
        let second = DmaBuffer::alloc(256, 16).unwrap();
        let _ = addr;
        assert!(unsafe { second.as_slice() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_pool_phys_is_null() {
        assert!(phys_to_virt(0x3).is_null());
    }
}
