//! Page-granular kernel heap.
//!
//! A bump allocator over `[KERNEL_HEAP_BASE, KERNEL_HEAP_BASE +
//! KERNEL_HEAP_SIZE)`.  Each allocation is rounded up to whole pages,
//! backed by frames from the frame allocator, and mapped writable+global
//! into the kernel half.  Freed allocations return their frames and leave
//! the virtual range unmapped; the bump pointer never rewinds, so virtual
//! space is consumed monotonically.  The contract is "no use-after-free",
//! not "low fragmentation"; callers needing churn use the slab-style Rust
//! allocator instead.
//!
//! Allocation sizes are recorded in a side table keyed by base address;
//! `krealloc` needs no cooperation from the caller.

use alloc::collections::BTreeMap;

use super::{phys_to_virt, AddressSpace, FrameAllocator, PageFlags};
use crate::config::PAGE_SIZE;

const PAGE: u64 = PAGE_SIZE as u64;

/// Bump-style kernel heap state.
pub struct KernelHeap {
    current: u64,
    end: u64,
    /// Base address -> allocation size in bytes (page-rounded).
    sizes: BTreeMap<u64, usize>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        KernelHeap {
            current: 0,
            end: 0,
            sizes: BTreeMap::new(),
        }
    }

    /// Set the heap bounds.  Called once during memory bring-up.
    pub fn init(&mut self, base: u64, end: u64) {
        self.current = base;
        self.end = end;
    }

    pub fn is_initialized(&self) -> bool {
        self.end != 0
    }

    /// Bytes of virtual heap space consumed so far.
    pub fn used(&self) -> u64 {
        self.current
    }

    /// Allocate `size` bytes (rounded up to whole pages).  Returns the
    /// virtual address, or `None` when the heap window or physical memory
    /// is exhausted.
    pub fn kmalloc(
        &mut self,
        fa: &mut FrameAllocator,
        space: &mut AddressSpace,
        size: usize,
    ) -> Option<u64> {
        if size == 0 || !self.is_initialized() {
            return None;
        }

        let bytes = (size.div_ceil(PAGE_SIZE) * PAGE_SIZE) as u64;
        if self.current + bytes > self.end {
            crate::error!("VMM", "kernel heap exhausted: requested {} bytes", size);
            return None;
        }

        let base = self.current;
        let pages = bytes / PAGE;
        for i in 0..pages {
            let virt = base + i * PAGE;
            let ok = fa.allocate_page().and_then(|frame| {
                // Zero through the physical window before the page becomes
                // reachable.
                unsafe {
                    core::ptr::write_bytes(phys_to_virt(frame), 0, PAGE_SIZE);
                }
                let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL;
                match space.map_page(fa, virt, frame, flags) {
                    Ok(()) => Some(()),
                    Err(_) => {
                        fa.free_page(frame);
                        None
                    }
                }
            });

            if ok.is_none() {
                // Unwind the pages this call already mapped; unmap returns
                // their frames.
                for j in 0..i {
                    let _ = space.unmap_page(fa, base + j * PAGE);
                }
                return None;
            }
        }

        self.sizes.insert(base, bytes as usize);
        self.current += bytes;
        Some(base)
    }

    /// Allocate with an alignment guarantee.  Over-allocates and stores
    /// the raw base in the word preceding the aligned address so `kfree`
    /// can recover it.
    pub fn kmalloc_aligned(
        &mut self,
        fa: &mut FrameAllocator,
        space: &mut AddressSpace,
        size: usize,
        align: usize,
    ) -> Option<u64> {
        if align == 0 || !align.is_power_of_two() {
            return self.kmalloc(fa, space, size);
        }
        let align = align.max(16) as u64;
        if align as usize <= PAGE_SIZE {
            // Page-granular allocations are already page-aligned.
            return self.kmalloc(fa, space, size);
        }

        let raw = self.kmalloc(fa, space, size + align as usize + 8)?;
        let aligned = (raw + 8 + align - 1) & !(align - 1);
        self.write_u64(space, aligned - 8, raw)?;
        Some(aligned)
    }

    /// Free an allocation by base or aligned address.
    pub fn kfree(&mut self, fa: &mut FrameAllocator, space: &mut AddressSpace, addr: u64) {
        if addr == 0 {
            return;
        }

        if self.sizes.contains_key(&addr) {
            self.release(fa, space, addr);
            return;
        }

        // Not a recorded base: assume an aligned pointer and recover the
        // raw base from the preceding word.
        if let Some(raw) = self.read_u64(space, addr.wrapping_sub(8)) {
            if self.sizes.contains_key(&raw) {
                self.release(fa, space, raw);
                return;
            }
        }

        crate::warning!("VMM", "kfree of unknown pointer {:#018x}", addr);
    }

    /// Resize an allocation.  The allocator tracked the old size, so the
    /// overlap is copied without caller cooperation.
    pub fn krealloc(
        &mut self,
        fa: &mut FrameAllocator,
        space: &mut AddressSpace,
        addr: u64,
        new_size: usize,
    ) -> Option<u64> {
        if addr == 0 {
            return self.kmalloc(fa, space, new_size);
        }
        if new_size == 0 {
            self.kfree(fa, space, addr);
            return None;
        }

        // Resolve the allocation base and how many usable bytes sit at
        // `addr` (aligned pointers sit inside a larger raw allocation).
        let base = if self.sizes.contains_key(&addr) {
            addr
        } else {
            let raw = self.read_u64(space, addr.wrapping_sub(8))?;
            if !self.sizes.contains_key(&raw) {
                crate::warning!("VMM", "krealloc of unknown pointer {:#018x}", addr);
                return None;
            }
            raw
        };
        let usable = self.sizes[&base] - (addr - base) as usize;

        let new_addr = self.kmalloc(fa, space, new_size)?;
        self.copy(space, new_addr, addr, usable.min(new_size));
        self.kfree(fa, space, addr);
        Some(new_addr)
    }

    fn release(&mut self, fa: &mut FrameAllocator, space: &mut AddressSpace, base: u64) {
        let bytes = self.sizes.remove(&base).unwrap() as u64;
        for i in 0..bytes / PAGE {
            if space.unmap_page(fa, base + i * PAGE).is_err() {
                crate::warning!("VMM", "kfree: page {:#018x} was not mapped", base + i * PAGE);
            }
        }
    }

    // All heap-content access goes through translation and the physical
    // window, so these work identically on the live kernel and in host
    // tests.

    fn write_u64(&self, space: &AddressSpace, virt: u64, value: u64) -> Option<()> {
        let phys = space.translate(virt)?;
        unsafe {
            core::ptr::write_unaligned(phys_to_virt(phys) as *mut u64, value);
        }
        Some(())
    }

    fn read_u64(&self, space: &AddressSpace, virt: u64) -> Option<u64> {
        let phys = space.translate(virt)?;
        Some(unsafe { core::ptr::read_unaligned(phys_to_virt(phys) as *const u64) })
    }

    fn copy(&self, space: &AddressSpace, dst: u64, src: u64, len: usize) {
        let mut copied = 0u64;
        let len = len as u64;
        while copied < len {
            let src_virt = src + copied;
            let dst_virt = dst + copied;
            let src_room = PAGE - (src_virt % PAGE);
            let dst_room = PAGE - (dst_virt % PAGE);
            let chunk = (len - copied).min(src_room).min(dst_room);

            let (Some(src_phys), Some(dst_phys)) =
                (space.translate(src_virt), space.translate(dst_virt))
            else {
                return;
            };
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(src_phys),
                    phys_to_virt(dst_phys),
                    chunk as usize,
                );
            }
            copied += chunk;
        }
    }
}
