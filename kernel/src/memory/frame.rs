//! Physical frame allocator.
//!
//! RAM is tracked as a set of disjoint regions, each with a bitmap where
//! bit i set means page i of the region is allocated or reserved.  Bitmap
//! words come from a fixed pool inside the allocator so the frame allocator
//! needs no heap; it is the first subsystem up.
//!
//! Counters are kept consistent at all times: `free + used == total`, and
//! `used == pages_allocated - pages_freed` for pages that went through
//! `allocate_*`/`free_*`.

use crate::boot::{MemoryMapEntry, MemoryType};
use crate::config::{BITMAP_POOL_WORDS, MAX_MEMORY_REGIONS, PAGE_SIZE};

const PAGE: u64 = PAGE_SIZE as u64;

/// One contiguous range of physical memory.
#[derive(Debug, Clone, Copy)]
struct MemoryRegion {
    base: u64,
    size: u64,
    total_pages: usize,
    free_pages: usize,
    /// First word of this region's bitmap in the shared pool.
    bitmap_start: usize,
}

impl MemoryRegion {
    const EMPTY: MemoryRegion = MemoryRegion {
        base: 0,
        size: 0,
        total_pages: 0,
        free_pages: 0,
        bitmap_start: 0,
    };

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Page-granular physical allocator over disjoint bitmap-tracked regions.
pub struct FrameAllocator {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    region_count: usize,
    bitmap_pool: [u64; BITMAP_POOL_WORDS],
    pool_words_used: usize,

    total_pages: usize,
    free_pages: usize,
    used_pages: usize,
    reserved_bytes: u64,
    pages_allocated: u64,
    pages_freed: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        FrameAllocator {
            regions: [MemoryRegion::EMPTY; MAX_MEMORY_REGIONS],
            region_count: 0,
            bitmap_pool: [0; BITMAP_POOL_WORDS],
            pool_words_used: 0,
            total_pages: 0,
            free_pages: 0,
            used_pages: 0,
            reserved_bytes: 0,
            pages_allocated: 0,
            pages_freed: 0,
        }
    }

    /// Ingest the loader's memory map.  Only `Free` entries become
    /// allocatable; every other kind is marked reserved where it overlaps a
    /// region.  Adjacent free ranges are merged before the bitmaps are
    /// built.
    pub fn init(&mut self, entries: &[MemoryMapEntry]) {
        crate::info!("PMM", "initializing with {} memory map entries", entries.len());

        // Stage, sort, and merge the free ranges first: merged regions get
        // one contiguous bitmap instead of stitched-together fragments.
        let mut free: [(u64, u64); MAX_MEMORY_REGIONS] = [(0, 0); MAX_MEMORY_REGIONS];
        let mut free_count = 0;

        for entry in entries {
            if entry.region_type != MemoryType::Free {
                continue;
            }
            let base = align_up(entry.base_address, PAGE);
            let shrink = base - entry.base_address;
            if entry.region_length <= shrink {
                continue;
            }
            let size = align_down(entry.region_length - shrink, PAGE);
            if size == 0 {
                continue;
            }
            if free_count == MAX_MEMORY_REGIONS {
                crate::error!("PMM", "maximum memory regions exceeded");
                break;
            }
            free[free_count] = (base, size);
            free_count += 1;
        }

        // Insertion sort by base; the map is small.
        for i in 1..free_count {
            let mut j = i;
            while j > 0 && free[j - 1].0 > free[j].0 {
                free.swap(j - 1, j);
                j -= 1;
            }
        }

        // Merge adjacent ranges.
        let mut merged = 0;
        for i in 0..free_count {
            if merged > 0 && free[merged - 1].0 + free[merged - 1].1 == free[i].0 {
                free[merged - 1].1 += free[i].1;
            } else {
                free[merged] = free[i];
                merged += 1;
            }
        }

        for &(base, size) in free.iter().take(merged) {
            if self.init_region(base, size) {
                crate::debug!(
                    "PMM",
                    "added free region {:#018x}..{:#018x} ({} MiB)",
                    base,
                    base + size,
                    size / (1024 * 1024)
                );
            }
        }

        // Reserve everything the firmware claims, wherever it overlaps a
        // tracked region.
        for entry in entries {
            if entry.region_type == MemoryType::Free {
                continue;
            }
            self.mark_range(entry.base_address, entry.region_length, true);
            if matches!(
                entry.region_type,
                MemoryType::Reserved | MemoryType::BadMemory
            ) {
                self.reserved_bytes += entry.region_length;
            }
        }

        crate::info!(
            "PMM",
            "pages: total={} free={} used={}, reserved={} KiB",
            self.total_pages,
            self.free_pages,
            self.used_pages,
            self.reserved_bytes / 1024
        );
    }

    fn init_region(&mut self, base: u64, size: u64) -> bool {
        if self.region_count >= MAX_MEMORY_REGIONS {
            crate::error!("PMM", "maximum memory regions exceeded");
            return false;
        }
        if size < PAGE {
            return false;
        }

        let total_pages = (size / PAGE) as usize;
        let words = total_pages.div_ceil(64);
        if self.pool_words_used + words > BITMAP_POOL_WORDS {
            crate::error!("PMM", "bitmap pool exhausted");
            return false;
        }

        let start = self.pool_words_used;
        self.bitmap_pool[start..start + words].fill(0);
        self.pool_words_used += words;

        self.regions[self.region_count] = MemoryRegion {
            base,
            size,
            total_pages,
            free_pages: total_pages,
            bitmap_start: start,
        };
        self.region_count += 1;

        self.total_pages += total_pages;
        self.free_pages += total_pages;
        true
    }

    // ── Bitmap primitives ───────────────────────────────────

    fn test_bit(&self, region: usize, page: usize) -> bool {
        let word = self.regions[region].bitmap_start + page / 64;
        self.bitmap_pool[word] & (1 << (page % 64)) != 0
    }

    /// Flip one page's bit and keep every counter consistent.  Returns
    /// whether the bit actually changed.
    fn set_bit(&mut self, region: usize, page: usize, used: bool) -> bool {
        let word = self.regions[region].bitmap_start + page / 64;
        let mask = 1u64 << (page % 64);
        let was_used = self.bitmap_pool[word] & mask != 0;
        if was_used == used {
            return false;
        }
        if used {
            self.bitmap_pool[word] |= mask;
            self.regions[region].free_pages -= 1;
            self.free_pages -= 1;
            self.used_pages += 1;
        } else {
            self.bitmap_pool[word] &= !mask;
            self.regions[region].free_pages += 1;
            self.free_pages += 1;
            self.used_pages -= 1;
        }
        true
    }

    /// Mark an arbitrary physical range used/free in every overlapping
    /// region.
    fn mark_range(&mut self, base: u64, size: u64, used: bool) {
        let base = align_down(base, PAGE);
        let end = align_up(base + size, PAGE);

        for r in 0..self.region_count {
            let region = self.regions[r];
            let lo = base.max(region.base);
            let hi = end.min(region.base + region.size);
            if lo >= hi {
                continue;
            }
            let first = ((lo - region.base) / PAGE) as usize;
            let last = ((hi - region.base) / PAGE) as usize;
            for page in first..last {
                self.set_bit(r, page, used);
            }
        }
    }

    // ── Allocation ──────────────────────────────────────────

    /// Allocate a single page.  First clear bit across regions in order.
    pub fn allocate_page(&mut self) -> Option<u64> {
        for r in 0..self.region_count {
            let region = self.regions[r];
            if region.free_pages == 0 {
                continue;
            }
            let words = region.total_pages.div_ceil(64);
            for w in 0..words {
                let word = self.bitmap_pool[region.bitmap_start + w];
                if word == u64::MAX {
                    continue;
                }
                let bit = (!word).trailing_zeros() as usize;
                let page = w * 64 + bit;
                if page >= region.total_pages {
                    break;
                }
                self.set_bit(r, page, true);
                self.pages_allocated += 1;
                let address = region.base + page as u64 * PAGE;
                crate::trace!("PMM", "allocated page {:#018x}", address);
                return Some(address);
            }
        }

        crate::error!("PMM", "out of memory: failed to allocate page");
        None
    }

    /// Allocate `count` consecutive pages within one region, first-fit.
    pub fn allocate_pages(&mut self, count: usize) -> Option<u64> {
        self.allocate_run(count, 1)
    }

    /// Allocate `count` consecutive pages whose base address is a multiple
    /// of `alignment`.  The alignment is rounded up to the next
    /// power-of-two multiple of the page size.
    pub fn allocate_aligned(&mut self, count: usize, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(PAGE).next_power_of_two();
        self.allocate_run(count, alignment)
    }

    fn allocate_run(&mut self, count: usize, alignment: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }

        for r in 0..self.region_count {
            let region = self.regions[r];
            if region.free_pages < count {
                continue;
            }

            let mut run_start = 0;
            let mut run_len = 0;
            for page in 0..region.total_pages {
                if self.test_bit(r, page) {
                    run_len = 0;
                    continue;
                }
                if run_len == 0 {
                    // A run can only start at a properly aligned address;
                    // pages after the first are unconstrained.
                    let candidate = region.base + page as u64 * PAGE;
                    if candidate % alignment != 0 {
                        continue;
                    }
                    run_start = page;
                }
                run_len += 1;
                if run_len == count {
                    for p in run_start..run_start + count {
                        self.set_bit(r, p, true);
                    }
                    self.pages_allocated += count as u64;
                    let address = region.base + run_start as u64 * PAGE;
                    crate::trace!("PMM", "allocated {} pages at {:#018x}", count, address);
                    return Some(address);
                }
            }
        }

        crate::error!(
            "PMM",
            "out of memory: failed to allocate {} pages (alignment {:#x})",
            count,
            alignment
        );
        None
    }

    // ── Freeing ─────────────────────────────────────────────

    /// Free one page.  Unaligned addresses and double frees are non-fatal:
    /// they log a warning and change nothing.
    pub fn free_page(&mut self, addr: u64) {
        if addr % PAGE != 0 {
            crate::warning!("PMM", "attempt to free unaligned page {:#018x}", addr);
            return;
        }

        for r in 0..self.region_count {
            if !self.regions[r].contains(addr) {
                continue;
            }
            let page = ((addr - self.regions[r].base) / PAGE) as usize;
            if !self.test_bit(r, page) {
                crate::warning!("PMM", "double free detected: {:#018x}", addr);
                return;
            }
            self.set_bit(r, page, false);
            self.pages_freed += 1;
            crate::trace!("PMM", "freed page {:#018x}", addr);
            return;
        }

        crate::error!("PMM", "attempt to free unknown page {:#018x}", addr);
    }

    /// Free a run of pages.  Pages already free are skipped with a warning
    /// and do not perturb the counters.
    pub fn free_pages(&mut self, base: u64, count: usize) {
        if base % PAGE != 0 {
            crate::warning!("PMM", "attempt to free unaligned pages at {:#018x}", base);
            return;
        }
        if count == 0 {
            return;
        }

        for r in 0..self.region_count {
            if !self.regions[r].contains(base) {
                continue;
            }
            let start = ((base - self.regions[r].base) / PAGE) as usize;
            if start + count > self.regions[r].total_pages {
                crate::error!(
                    "PMM",
                    "page range out of region: {:#018x} + {} pages",
                    base,
                    count
                );
                return;
            }
            for p in 0..count {
                if self.set_bit(r, start + p, false) {
                    self.pages_freed += 1;
                } else {
                    crate::warning!(
                        "PMM",
                        "double free detected in range: {:#018x}",
                        base + p as u64 * PAGE
                    );
                }
            }
            return;
        }

        crate::error!(
            "PMM",
            "attempt to free unknown pages {:#018x} + {} pages",
            base,
            count
        );
    }

    // ── Probes and statistics ───────────────────────────────

    pub fn is_page_free(&self, addr: u64) -> bool {
        for r in 0..self.region_count {
            if self.regions[r].contains(addr) {
                let page = ((addr - self.regions[r].base) / PAGE) as usize;
                return !self.test_bit(r, page);
            }
        }
        false
    }

    pub fn is_page_allocated(&self, addr: u64) -> bool {
        for r in 0..self.region_count {
            if self.regions[r].contains(addr) {
                let page = ((addr - self.regions[r].base) / PAGE) as usize;
                return self.test_bit(r, page);
            }
        }
        false
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    pub fn free_memory(&self) -> u64 {
        self.free_pages as u64 * PAGE
    }

    pub fn total_memory(&self) -> u64 {
        self.total_pages as u64 * PAGE
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn dump_statistics(&self) {
        crate::info!("PMM", "physical memory statistics:");
        crate::info!("PMM", "  total pages: {}", self.total_pages);
        crate::info!("PMM", "  free pages:  {}", self.free_pages);
        crate::info!("PMM", "  used pages:  {}", self.used_pages);
        crate::info!("PMM", "  allocations: {}", self.pages_allocated);
        crate::info!("PMM", "  frees:       {}", self.pages_freed);
        for r in 0..self.region_count {
            let region = &self.regions[r];
            crate::info!(
                "PMM",
                "  region {}: {:#018x}..{:#018x} ({}/{} pages free)",
                r,
                region.base,
                region.base + region.size,
                region.free_pages,
                region.total_pages
            );
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryMapEntry, MemoryType};

    fn allocator_with(entries: &[MemoryMapEntry]) -> Box<FrameAllocator> {
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(entries);
        fa
    }

    fn one_region() -> Box<FrameAllocator> {
        allocator_with(&[MemoryMapEntry::new(0x100000, 0x100000, MemoryType::Free)])
    }

    #[test]
    fn first_allocation_is_region_base() {
        let mut fa = one_region();
        assert_eq!(fa.total_pages(), 256);
        assert_eq!(fa.allocate_page(), Some(0x100000));
        assert_eq!(fa.free_page_count(), 255);
    }

    #[test]
    fn free_restores_count_and_double_free_is_idempotent() {
        let mut fa = one_region();
        let before = fa.free_page_count();
        let page = fa.allocate_page().unwrap();
        assert_eq!(fa.free_page_count(), before - 1);

        fa.free_page(page);
        assert_eq!(fa.free_page_count(), before);

        // Double free must not decrement (or increment) anything further.
        fa.free_page(page);
        assert_eq!(fa.free_page_count(), before);
        assert_eq!(fa.used_pages(), 0);
    }

    #[test]
    fn unaligned_free_is_a_noop() {
        let mut fa = one_region();
        let page = fa.allocate_page().unwrap();
        fa.free_page(page + 123);
        assert!(fa.is_page_allocated(page));
    }

    #[test]
    fn multi_page_runs_are_consecutive() {
        let mut fa = one_region();
        let base = fa.allocate_pages(4).unwrap();
        for i in 0..4 {
            assert!(fa.is_page_allocated(base + i * PAGE));
        }
        assert!(fa.is_page_free(base + 4 * PAGE));

        fa.free_pages(base, 4);
        for i in 0..4 {
            assert!(fa.is_page_free(base + i * PAGE));
        }
    }

    #[test]
    fn run_skips_over_holes() {
        let mut fa = one_region();
        let a = fa.allocate_page().unwrap();
        let b = fa.allocate_page().unwrap();
        fa.free_page(a);
        // One free page at the region base, then page b allocated: a run of
        // two cannot start before b.
        let run = fa.allocate_pages(2).unwrap();
        assert!(run > b);
    }

    #[test]
    fn aligned_allocation_is_aligned() {
        let mut fa = one_region();
        // Drift the cursor off alignment first.
        fa.allocate_page().unwrap();
        let addr = fa.allocate_aligned(2, 0x10000).unwrap();
        assert_eq!(addr % 0x10000, 0);
        assert!(fa.is_page_allocated(addr));
        assert!(fa.is_page_allocated(addr + PAGE));
    }

    #[test]
    fn alignment_rounds_to_power_of_two() {
        let mut fa = one_region();
        // 3 pages rounds up to a 4-page (0x4000) alignment.
        let addr = fa.allocate_aligned(1, 3 * PAGE).unwrap();
        assert_eq!(addr % 0x4000, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut fa = allocator_with(&[MemoryMapEntry::new(0x100000, 0x3000, MemoryType::Free)]);
        assert!(fa.allocate_page().is_some());
        assert!(fa.allocate_page().is_some());
        assert!(fa.allocate_page().is_some());
        assert_eq!(fa.allocate_page(), None);
        assert_eq!(fa.allocate_pages(1), None);
    }

    #[test]
    fn run_does_not_span_regions() {
        let mut fa = allocator_with(&[
            MemoryMapEntry::new(0x100000, 0x2000, MemoryType::Free),
            MemoryMapEntry::new(0x200000, 0x2000, MemoryType::Free),
        ]);
        // Four pages total across two regions, but no region holds four.
        assert_eq!(fa.total_pages(), 4);
        assert_eq!(fa.allocate_pages(4), None);
        assert!(fa.allocate_pages(2).is_some());
    }

    #[test]
    fn adjacent_free_regions_merge() {
        let fa = allocator_with(&[
            MemoryMapEntry::new(0x100000, 0x10000, MemoryType::Free),
            MemoryMapEntry::new(0x110000, 0x10000, MemoryType::Free),
        ]);
        assert_eq!(fa.region_count(), 1);
        assert_eq!(fa.total_pages(), 32);
    }

    #[test]
    fn merged_region_allows_spanning_runs() {
        let mut fa = allocator_with(&[
            MemoryMapEntry::new(0x100000, 0x2000, MemoryType::Free),
            MemoryMapEntry::new(0x102000, 0x2000, MemoryType::Free),
        ]);
        // After merging, a 4-page run fits.
        assert_eq!(fa.allocate_pages(4), Some(0x100000));
    }

    #[test]
    fn reserved_entries_are_not_allocatable() {
        let mut fa = allocator_with(&[
            MemoryMapEntry::new(0x100000, 0x4000, MemoryType::Free),
            MemoryMapEntry::new(0x101000, 0x1000, MemoryType::Reserved),
        ]);
        assert_eq!(fa.free_page_count(), 3);
        assert_eq!(fa.allocate_page(), Some(0x100000));
        // 0x101000 is reserved; the next allocation skips it.
        assert_eq!(fa.allocate_page(), Some(0x102000));
    }

    #[test]
    fn counters_stay_consistent() {
        let mut fa = one_region();
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(fa.allocate_page().unwrap());
        }
        assert_eq!(fa.free_page_count() + fa.used_pages(), fa.total_pages());
        for addr in held {
            fa.free_page(addr);
        }
        assert_eq!(fa.used_pages(), 0);
        assert_eq!(fa.free_page_count(), fa.total_pages());
    }

    #[test]
    fn unaligned_map_entries_are_trimmed() {
        let fa = allocator_with(&[MemoryMapEntry::new(0x100800, 0x2800, MemoryType::Free)]);
        // Base rounds up to 0x101000, leaving 0x2000 usable.
        assert_eq!(fa.total_pages(), 2);
    }
}
