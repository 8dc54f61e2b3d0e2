//! Memory management subsystem.
//!
//! Three layers, initialized in this order and never torn down:
//!
//! 1. **Frame allocator** ([`frame`]): owns every page of physical RAM the
//!    loader reported as free.
//! 2. **Virtual memory** ([`paging`]): 4-level page tables and address-space
//!    lifecycle, translation.
//! 3. **Kernel heap** ([`heap`]): page-granular bump allocator for kernel
//!    stacks and other physically-backed buffers.
//!
//! All table memory is reached through the physical-memory window the
//! loader maps for us ([`phys_to_virt`]).  Under `cargo test` that window
//! is a per-thread arena, which lets the table walker, the heap, and
//! everything above them run in host unit tests.

pub mod frame;
pub mod heap;
pub mod paging;

use alloc::sync::Arc;
use core::fmt;

use crate::boot::BootInfo;
use crate::config::{KERNEL_BASE, KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, PAGE_SIZE};
use crate::kernel_singleton;
use crate::sync::SpinLock;

pub use frame::FrameAllocator;
pub use paging::{AddressSpace, PageFlags};

/// Shared handle to an address space.  The per-space lock is the spinlock
/// flavor because page-table mutation happens under interrupt-disabled
/// critical sections.
pub type AddressSpaceRef = Arc<SpinLock<AddressSpace>>;

/// Memory subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No frame, heap page, or table slot available.
    OutOfMemory,
    /// Unaligned or otherwise unusable address.
    InvalidArgument,
    /// The target leaf slot is already populated; remapping is never
    /// silent.
    AlreadyMapped,
    /// No mapping exists at the given address.
    NotMapped,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of memory"),
            MemoryError::InvalidArgument => write!(f, "invalid argument"),
            MemoryError::AlreadyMapped => write!(f, "already mapped"),
            MemoryError::NotMapped => write!(f, "not mapped"),
        }
    }
}

// ── Physical memory window ──────────────────────────────────

#[cfg(not(test))]
static PHYS_OFFSET: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Translate a physical address into a kernel-accessible pointer through
/// the loader's physical-memory mapping.
#[cfg(not(test))]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    let offset = PHYS_OFFSET.load(core::sync::atomic::Ordering::Acquire);
    (offset + phys) as *mut u8
}

/// Size of the simulated physical memory arena used by host tests.
#[cfg(test)]
pub const TEST_PHYS_MEMORY: usize = 32 * 1024 * 1024;

#[cfg(test)]
std::thread_local! {
    static PHYS_ARENA: core::cell::RefCell<alloc::vec::Vec<u8>> =
        const { core::cell::RefCell::new(alloc::vec::Vec::new()) };
}

/// Test build: physical addresses index a per-thread arena, so page-table
/// walks read and write ordinary heap memory.
#[cfg(test)]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    PHYS_ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        if arena.is_empty() {
            arena.resize(TEST_PHYS_MEMORY, 0);
        }
        assert!(
            (phys as usize) < TEST_PHYS_MEMORY,
            "test physical address out of range: {:#x}",
            phys
        );
        unsafe { arena.as_mut_ptr().add(phys as usize) }
    })
}

// ── Singletons ──────────────────────────────────────────────

kernel_singleton!(
    FRAME_ALLOCATOR,
    SpinLock,
    FrameAllocator,
    FrameAllocator::new(),
    pub with_frame_allocator
);

/// Address-space bookkeeping: the kernel space (created first, never
/// destroyed) and whichever space is currently active on the CPU.
pub struct Vmm {
    kernel_space: Option<AddressSpaceRef>,
    current_space: Option<AddressSpaceRef>,
}

impl Vmm {
    pub const fn new() -> Self {
        Vmm {
            kernel_space: None,
            current_space: None,
        }
    }
}

kernel_singleton!(VMM, SpinLock, Vmm, Vmm::new(), pub with_vmm);

kernel_singleton!(
    KERNEL_HEAP,
    SpinLock,
    heap::KernelHeap,
    heap::KernelHeap::new(),
    pub with_heap
);

// ── Initialization ──────────────────────────────────────────

/// Bring up the frame allocator, the kernel address space, and the kernel
/// heap from the loader's memory map.  Failure at this stage is fatal.
pub fn init(boot_info: &BootInfo) {
    #[cfg(not(test))]
    PHYS_OFFSET.store(
        boot_info.physical_memory_offset,
        core::sync::atomic::Ordering::Release,
    );

    let entries = unsafe { boot_info.memory_map() };
    init_core(entries);

    // Mirror the kernel image into the kernel space so the mappings are
    // shared into every later address space.
    let kernel_len = boot_info.kernel_end.saturating_sub(boot_info.kernel_start);
    if kernel_len > 0 {
        let kernel_space = kernel_space().expect("kernel space missing after init");
        let mut space = kernel_space.lock();
        with_frame_allocator(|fa| {
            let pages = (kernel_len as usize).div_ceil(PAGE_SIZE);
            for i in 0..pages as u64 {
                let virt = KERNEL_BASE + i * PAGE_SIZE as u64;
                let phys = boot_info.kernel_start + i * PAGE_SIZE as u64;
                if let Err(e) = space.map_page(
                    fa,
                    virt,
                    phys,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL,
                ) {
                    crate::fatal!("VMM", "failed to map kernel image: {}", e);
                }
            }
        });
    }

    crate::info!("VMM", "virtual memory manager initialized");
}

/// Shared bring-up path for the kernel image and for host tests.
fn init_core(entries: &[crate::boot::MemoryMapEntry]) {
    with_frame_allocator(|fa| fa.init(entries));

    let kernel_space = with_frame_allocator(|fa| AddressSpace::new_kernel(fa));
    let kernel_space = match kernel_space {
        Some(space) => Arc::new(SpinLock::new(space)),
        None => crate::fatal!("VMM", "failed to allocate kernel PML4"),
    };

    with_vmm(|vmm| {
        vmm.kernel_space = Some(kernel_space.clone());
        vmm.current_space = Some(kernel_space.clone());
    });

    with_heap(|h| h.init(KERNEL_HEAP_BASE, KERNEL_HEAP_BASE + KERNEL_HEAP_SIZE));
}

/// Host-test bring-up: one free region inside the simulated arena.
#[cfg(test)]
pub fn init_for_tests(region_base: u64, region_length: u64) {
    use crate::boot::{MemoryMapEntry, MemoryType};

    let map = [MemoryMapEntry::new(region_base, region_length, MemoryType::Free)];
    init_core(&map);
}

// ── Address-space lifecycle ─────────────────────────────────

/// The kernel address space handle.
pub fn kernel_space() -> Option<AddressSpaceRef> {
    with_vmm(|vmm| vmm.kernel_space.clone())
}

/// The currently active address space handle.
pub fn current_space() -> Option<AddressSpaceRef> {
    with_vmm(|vmm| vmm.current_space.clone())
}

/// Create a new address space sharing the kernel's higher half.
pub fn create_address_space() -> Option<AddressSpaceRef> {
    let kernel = kernel_space()?;
    let kernel = kernel.lock();
    let space = with_frame_allocator(|fa| AddressSpace::new_user(fa, &kernel))?;
    Some(Arc::new(SpinLock::new(space)))
}

/// Drop one reference to an address space, tearing down its user half when
/// the count reaches zero.  The kernel space is never destroyed.
pub fn destroy_address_space(space: &AddressSpaceRef) {
    let mut guard = space.lock();
    if guard.is_kernel() {
        return;
    }
    if guard.dec_ref() > 0 {
        return;
    }
    with_frame_allocator(|fa| guard.destroy_user_half(fa));
    crate::debug!("VMM", "destroyed address space");
}

/// Make `space` the active address space.  The incoming space gains a
/// reference; the outgoing one loses the reference its activation took.
pub fn switch_address_space(space: &AddressSpaceRef) {
    let previous = with_vmm(|vmm| {
        if let Some(ref current) = vmm.current_space {
            if Arc::ptr_eq(current, space) {
                return None;
            }
        }
        let previous = vmm.current_space.replace(space.clone());
        space.lock().inc_ref();
        Some(previous)
    });

    let Some(previous) = previous else {
        return; // already active
    };

    #[cfg(not(test))]
    unsafe {
        use x86_64::registers::control::Cr3;
        use x86_64::structures::paging::PhysFrame;
        let frame =
            PhysFrame::containing_address(x86_64::PhysAddr::new(space.lock().pml4_phys()));
        let (_, flags) = Cr3::read();
        Cr3::write(frame, flags);
    }

    if let Some(previous) = previous {
        destroy_address_space(&previous);
    }
}

// ── Current-space convenience wrappers ──────────────────────

/// Map one page in the active address space.
pub fn map_page(virt: u64, phys: u64, flags: PageFlags) -> Result<(), MemoryError> {
    let space = current_space().ok_or(MemoryError::InvalidArgument)?;
    let mut space = space.lock();
    with_frame_allocator(|fa| space.map_page(fa, virt, phys, flags))
}

/// Unmap one page in the active address space, returning its frame.
pub fn unmap_page(virt: u64) -> Result<(), MemoryError> {
    let space = current_space().ok_or(MemoryError::InvalidArgument)?;
    let mut space = space.lock();
    with_frame_allocator(|fa| space.unmap_page(fa, virt))
}

/// Resolve a virtual address through the active address space.
pub fn get_physical_address(virt: u64) -> Option<u64> {
    let space = current_space()?;
    let space = space.lock();
    space.translate(virt)
}

/// Allocate a physical frame.
pub fn allocate_frame() -> Option<u64> {
    with_frame_allocator(|fa| fa.allocate_page())
}

/// Return a physical frame to the allocator.
pub fn free_frame(addr: u64) {
    with_frame_allocator(|fa| fa.free_page(addr));
}

// ── Kernel heap wrappers ────────────────────────────────────

/// Allocate from the page-granular kernel heap.
pub fn kmalloc(size: usize) -> Option<u64> {
    let space = current_space()?;
    with_heap(|h| {
        let mut space = space.lock();
        with_frame_allocator(|fa| h.kmalloc(fa, &mut space, size))
    })
}

/// Allocate with an alignment guarantee.
pub fn kmalloc_aligned(size: usize, align: usize) -> Option<u64> {
    let space = current_space()?;
    with_heap(|h| {
        let mut space = space.lock();
        with_frame_allocator(|fa| h.kmalloc_aligned(fa, &mut space, size, align))
    })
}

/// Resize an allocation, preserving its contents.
pub fn krealloc(addr: u64, new_size: usize) -> Option<u64> {
    let space = current_space()?;
    with_heap(|h| {
        let mut space = space.lock();
        with_frame_allocator(|fa| h.krealloc(fa, &mut space, addr, new_size))
    })
}

/// Free a kernel heap allocation.
pub fn kfree(addr: u64) {
    if let Some(space) = current_space() {
        with_heap(|h| {
            let mut space = space.lock();
            with_frame_allocator(|fa| h.kfree(fa, &mut space, addr))
        });
    }
}
