//! Kernel configuration constants.
//!
//! Compile-time configuration: memory layout, limits, timer rates.

/// Page size (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries per page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Number of levels in the paging hierarchy (PML4 -> PDPT -> PD -> PT).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Kernel virtual address base (higher half).
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel heap base (page-granular kmalloc region).
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_8000_1000_0000;

/// Kernel heap size (64 MiB of virtual space; frames are committed on
/// demand and the bump pointer never rewinds).
pub const KERNEL_HEAP_SIZE: u64 = 64 * 1024 * 1024;

/// Rust global allocator region base.
pub const RUST_HEAP_BASE: u64 = 0xFFFF_8000_0100_0000;

/// Rust global allocator region size (16 MiB).
pub const RUST_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of physical memory regions tracked by the frame
/// allocator.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Size of the frame-allocator bitmap pool in 64-bit words.  16384 words
/// cover 4 GiB of RAM at one bit per page.
pub const BITMAP_POOL_WORDS: usize = 16384;

/// Kernel stack size per thread (64 KiB).
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Thread-local storage size per thread.
pub const TLS_SIZE: usize = PAGE_SIZE;

/// Timer interrupt frequency in Hz.
pub const TIMER_FREQUENCY: u32 = 1000;

/// TSC ticks per millisecond.  The timestamp counter is the fine-grained
/// monotonic clock; a fixed calibration is good enough for time slices and
/// protocol timeouts.
pub const TSC_TICKS_PER_MS: u64 = 1_000_000;

/// Default scheduler time slice in TSC ticks (10 ms).
pub const TIME_SLICE_DEFAULT: u64 = 10 * TSC_TICKS_PER_MS;

/// Number of scheduler priority bands.
pub const SCHED_BANDS: usize = 4;

/// Serial debug port (COM1).
pub const DEBUG_SERIAL_PORT: u16 = 0x3F8;
