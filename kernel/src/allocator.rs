//! Rust global allocator initialization.
//!
//! `alloc::*` collections are served by a linked-list allocator over a
//! dedicated region, mapped page by page at boot.  This is separate from
//! the page-granular kernel heap in `memory::heap`: the linked-list heap
//! recycles small allocations, the kmalloc heap hands out physically
//! backed page runs.
//!
//! Under `cargo test` the host's allocator is used and this module is
//! inert.

use crate::memory::MemoryError;

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Map the allocator region and hand it to the linked-list heap.
#[cfg(not(test))]
pub fn init() -> Result<(), MemoryError> {
    use crate::config::{PAGE_SIZE, RUST_HEAP_BASE, RUST_HEAP_SIZE};
    use crate::memory::{self, PageFlags};

    let pages = RUST_HEAP_SIZE / PAGE_SIZE;
    for i in 0..pages as u64 {
        let virt = RUST_HEAP_BASE + i * PAGE_SIZE as u64;
        let frame = memory::allocate_frame().ok_or(MemoryError::OutOfMemory)?;
        memory::map_page(virt, frame, PageFlags::PRESENT | PageFlags::WRITABLE)?;
    }

    unsafe {
        ALLOCATOR
            .lock()
            .init(RUST_HEAP_BASE as *mut u8, RUST_HEAP_SIZE);
    }

    crate::info!("HEAP", "rust heap mapped: {} KiB", RUST_HEAP_SIZE / 1024);
    Ok(())
}

#[cfg(test)]
pub fn init() -> Result<(), MemoryError> {
    Ok(())
}

/// Allocation failure is unrecoverable for kernel collections.
#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error_handler(layout: alloc::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
