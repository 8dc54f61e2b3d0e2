//! 4-level page table management.
//!
//! x86_64 paging: PML4 -> PDPT -> PD -> PT, 512 entries per table.  Table
//! memory is reached through the physical-memory window, never through
//! recursive mappings.  Entries are raw `u64`s behind accessor methods;
//! the bit layout is the hardware's, not the compiler's.
//!
//! Every address space shares the kernel's higher half: PML4 entries
//! 256..512 are copied by value at creation, so the intermediate tables
//! they point to are shared structures and are never pruned or freed from
//! a non-kernel teardown.

use bitflags::bitflags;

use super::{phys_to_virt, FrameAllocator, MemoryError};
use crate::config::{PAGE_SIZE, PAGE_TABLE_ENTRIES};

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is present.
        const PRESENT = 1 << 0;
        /// Writable.
        const WRITABLE = 1 << 1;
        /// Accessible from user mode.
        const USER_ACCESSIBLE = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// 2 MiB / 1 GiB leaf at a non-PT level.
        const HUGE_PAGE = 1 << 7;
        /// Not flushed on CR3 reload.
        const GLOBAL = 1 << 8;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE = 1 << 63;
    }
}

/// Mask of the physical frame bits (12..51) in an entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE_PAGE.bits() != 0
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Clear the entry.  Non-present entries are always fully zeroed so no
    /// stale flag bits survive an unmap.
    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// The physical frame this entry points at, if present.
    pub fn addr(&self) -> Option<u64> {
        if self.is_present() {
            Some(self.0 & ADDR_MASK)
        } else {
            None
        }
    }

    pub fn set(&mut self, addr: u64, flags: PageFlags) {
        debug_assert!(addr & !ADDR_MASK == 0, "address must be page-aligned");
        self.0 = addr | flags.bits();
    }
}

type PageTable = [PageTableEntry; PAGE_TABLE_ENTRIES];

/// Split a canonical virtual address into its four table indices,
/// `[0]` = PT .. `[3]` = PML4.
fn table_indices(virt: u64) -> [usize; 4] {
    [
        ((virt >> 12) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 39) & 0x1FF) as usize,
    ]
}

/// Access a page table by the physical address of its frame.
///
/// # Safety
///
/// `phys` must be a page-aligned frame that actually holds a page table
/// owned by the caller's address space, and the caller must hold that
/// space's lock so no aliasing mutable access exists.
unsafe fn table_mut(phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

fn zero_frame(phys: u64) {
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys), 0, PAGE_SIZE);
    }
}

/// Invalidate one TLB entry after a mapping change.  Single-CPU target: a
/// local `invlpg` is sufficient; a multi-CPU port would need IPI shootdown.
fn flush_tlb(virt: u64) {
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(test)]
    let _ = virt;
}

/// One address space: a PML4 and its accounting.
pub struct AddressSpace {
    pml4_phys: u64,
    /// 4 KiB leaf mappings currently installed.
    mapped_pages: usize,
    /// Intermediate table frames this space allocated (excludes the PML4
    /// and shared kernel-half tables).
    table_pages: usize,
    reference_count: usize,
    kernel: bool,
}

impl AddressSpace {
    /// Create the kernel address space.  Called exactly once, before any
    /// other space exists.
    pub fn new_kernel(fa: &mut FrameAllocator) -> Option<AddressSpace> {
        let pml4_phys = fa.allocate_page()?;
        zero_frame(pml4_phys);
        Some(AddressSpace {
            pml4_phys,
            mapped_pages: 0,
            table_pages: 0,
            reference_count: 1,
            kernel: true,
        })
    }

    /// Create a user address space sharing the kernel's higher half.
    ///
    /// The upper 256 PML4 entries are copied by value; later kernel-space
    /// changes below the PML4 level remain visible everywhere because the
    /// shared slots point at the same intermediate tables.
    pub fn new_user(fa: &mut FrameAllocator, kernel: &AddressSpace) -> Option<AddressSpace> {
        let pml4_phys = fa.allocate_page()?;
        zero_frame(pml4_phys);

        let new_pml4 = unsafe { table_mut(pml4_phys) };
        let kernel_pml4 = unsafe { table_mut(kernel.pml4_phys) };
        new_pml4[256..].copy_from_slice(&kernel_pml4[256..]);

        crate::debug!("VMM", "created address space, pml4 {:#018x}", pml4_phys);
        Some(AddressSpace {
            pml4_phys,
            mapped_pages: 0,
            table_pages: 0,
            reference_count: 1,
            kernel: false,
        })
    }

    pub fn pml4_phys(&self) -> u64 {
        self.pml4_phys
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    pub fn table_pages(&self) -> usize {
        self.table_pages
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub fn inc_ref(&mut self) {
        self.reference_count += 1;
    }

    /// Decrement and return the new reference count.
    pub fn dec_ref(&mut self) -> usize {
        self.reference_count = self.reference_count.saturating_sub(1);
        self.reference_count
    }

    /// Map one 4 KiB page.  Absent intermediate tables are allocated and
    /// zeroed; an occupied leaf is an error, never a silent remap.
    pub fn map_page(
        &mut self,
        fa: &mut FrameAllocator,
        virt: u64,
        phys: u64,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        if virt % PAGE_SIZE as u64 != 0 || phys % PAGE_SIZE as u64 != 0 {
            crate::error!(
                "VMM",
                "unaligned address in map_page: virt={:#018x} phys={:#018x}",
                virt,
                phys
            );
            return Err(MemoryError::InvalidArgument);
        }

        let idx = table_indices(virt);
        let user = flags.contains(PageFlags::USER_ACCESSIBLE);

        let mut table_phys = self.pml4_phys;
        for level in (1..=3).rev() {
            let table = unsafe { table_mut(table_phys) };
            let entry = &mut table[idx[level]];

            if !entry.is_present() {
                let frame = fa.allocate_page().ok_or(MemoryError::OutOfMemory)?;
                zero_frame(frame);
                let mut inter = PageFlags::PRESENT | PageFlags::WRITABLE;
                if user {
                    inter |= PageFlags::USER_ACCESSIBLE;
                }
                entry.set(frame, inter);
                self.table_pages += 1;
            } else if entry.is_huge() {
                return Err(MemoryError::AlreadyMapped);
            }

            table_phys = entry.addr().unwrap();
        }

        let table = unsafe { table_mut(table_phys) };
        let leaf = &mut table[idx[0]];
        if leaf.is_present() {
            crate::warning!("VMM", "page already mapped: {:#018x}", virt);
            return Err(MemoryError::AlreadyMapped);
        }

        leaf.set(phys, flags);
        self.mapped_pages += 1;
        flush_tlb(virt);
        Ok(())
    }

    /// Map a contiguous range.  On mid-range failure the pages mapped by
    /// this call are unwound before returning the error.
    pub fn map_pages(
        &mut self,
        fa: &mut FrameAllocator,
        virt: u64,
        phys: u64,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), MemoryError> {
        for i in 0..count as u64 {
            let step = i * PAGE_SIZE as u64;
            if let Err(e) = self.map_page(fa, virt + step, phys + step, flags) {
                for j in 0..i {
                    let _ = self.unmap_page(fa, virt + j * PAGE_SIZE as u64);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap one page, free its backing frame, and prune any intermediate
    /// tables this left empty.  The shared higher half is never pruned.
    pub fn unmap_page(&mut self, fa: &mut FrameAllocator, virt: u64) -> Result<(), MemoryError> {
        if virt % PAGE_SIZE as u64 != 0 {
            crate::error!("VMM", "unaligned address in unmap_page: {:#018x}", virt);
            return Err(MemoryError::InvalidArgument);
        }

        let idx = table_indices(virt);

        // Walk down recording each table so the prune pass can go back up.
        let mut tables = [0u64; 4];
        let mut table_phys = self.pml4_phys;
        for level in (1..=3).rev() {
            tables[level] = table_phys;
            let table = unsafe { table_mut(table_phys) };
            let entry = table[idx[level]];
            if !entry.is_present() || entry.is_huge() {
                return Err(MemoryError::NotMapped);
            }
            table_phys = entry.addr().unwrap();
        }
        tables[0] = table_phys;

        let leaf = {
            let table = unsafe { table_mut(tables[0]) };
            let leaf = &mut table[idx[0]];
            if !leaf.is_present() {
                return Err(MemoryError::NotMapped);
            }
            let frame = leaf.addr().unwrap();
            leaf.set_unused();
            frame
        };

        fa.free_page(leaf);
        self.mapped_pages -= 1;
        flush_tlb(virt);

        // Prune bottom-up.  Higher-half tables are shared with the kernel
        // space and must survive even when empty.
        if idx[3] < 256 {
            for level in 0..3 {
                let table = unsafe { table_mut(tables[level]) };
                if table.iter().any(|e| e.is_present()) {
                    break;
                }
                fa.free_page(tables[level]);
                self.table_pages -= 1;
                let parent = unsafe { table_mut(tables[level + 1]) };
                parent[idx[level + 1]].set_unused();
            }
        }

        Ok(())
    }

    /// Unmap a range; reports failure if any page in the range failed.
    pub fn unmap_pages(
        &mut self,
        fa: &mut FrameAllocator,
        virt: u64,
        count: usize,
    ) -> Result<(), MemoryError> {
        let mut result = Ok(());
        for i in 0..count as u64 {
            if let Err(e) = self.unmap_page(fa, virt + i * PAGE_SIZE as u64) {
                result = Err(e);
            }
        }
        result
    }

    /// Resolve a virtual address to its physical address.  Huge-page
    /// leaves resolve by adding the offset within the large page.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        let idx = table_indices(virt);

        let mut table_phys = self.pml4_phys;
        for level in (0..=3).rev() {
            let table = unsafe { table_mut(table_phys) };
            let entry = table[idx[level]];
            if !entry.is_present() {
                return None;
            }
            if level == 0 {
                return Some(entry.addr().unwrap() + (virt & (PAGE_SIZE as u64 - 1)));
            }
            if entry.is_huge() {
                // 2 MiB at level 1, 1 GiB at level 2.
                let page_size = (PAGE_SIZE as u64) << (9 * level);
                return Some(entry.addr().unwrap() + (virt & (page_size - 1)));
            }
            table_phys = entry.addr().unwrap();
        }

        None
    }

    /// Tear down the user half (PML4 entries 0..256): every mapped frame,
    /// every intermediate table, then the PML4 itself.  The shared kernel
    /// half is left untouched.
    pub fn destroy_user_half(&mut self, fa: &mut FrameAllocator) {
        let pml4_phys = self.pml4_phys;
        for i in 0..256 {
            let entry = {
                let pml4 = unsafe { table_mut(pml4_phys) };
                pml4[i]
            };
            if let Some(table) = entry.addr() {
                if !entry.is_huge() {
                    free_table(fa, table, 3);
                } else {
                    fa.free_page(table);
                }
            }
        }
        fa.free_page(pml4_phys);
        self.mapped_pages = 0;
        self.table_pages = 0;
    }
}

/// Recursively free a table's children, then the table frame itself.
fn free_table(fa: &mut FrameAllocator, table_phys: u64, level: usize) {
    for i in 0..PAGE_TABLE_ENTRIES {
        let entry = {
            let table = unsafe { table_mut(table_phys) };
            table[i]
        };
        if let Some(child) = entry.addr() {
            if level > 1 && !entry.is_huge() {
                free_table(fa, child, level - 1);
            } else {
                fa.free_page(child);
            }
        }
    }
    fa.free_page(table_phys);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{MemoryMapEntry, MemoryType};

    const RW: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

    fn setup() -> (Box<FrameAllocator>, AddressSpace) {
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(&[MemoryMapEntry::new(0x100000, 0x400000, MemoryType::Free)]);
        let space = AddressSpace::new_kernel(&mut fa).unwrap();
        (fa, space)
    }

    #[test]
    fn map_then_translate() {
        let (mut fa, mut space) = setup();
        let phys = fa.allocate_page().unwrap();
        space
            .map_page(&mut fa, 0xFFFF_8000_0000_1000, phys, RW)
            .unwrap();
        assert_eq!(space.translate(0xFFFF_8000_0000_1000), Some(phys));
        assert_eq!(space.translate(0xFFFF_8000_0000_1234), Some(phys + 0x234));
    }

    #[test]
    fn unmap_frees_frame_and_translation() {
        let (mut fa, mut space) = setup();
        let phys = fa.allocate_page().unwrap();
        let virt = 0x4000_0000u64;

        space.map_page(&mut fa, virt, phys, RW).unwrap();
        assert!(fa.is_page_allocated(phys));

        space.unmap_page(&mut fa, virt).unwrap();
        assert_eq!(space.translate(virt), None);
        assert!(fa.is_page_free(phys));
    }

    #[test]
    fn map_unmap_restores_table_count() {
        let (mut fa, mut space) = setup();
        let before_tables = space.table_pages();
        let before_free = fa.free_page_count();

        let phys = fa.allocate_page().unwrap();
        space.map_page(&mut fa, 0x7000_0000, phys, RW).unwrap();
        assert_eq!(space.table_pages(), before_tables + 3);

        space.unmap_page(&mut fa, 0x7000_0000).unwrap();
        assert_eq!(space.table_pages(), before_tables);
        assert_eq!(space.mapped_pages(), 0);
        assert_eq!(fa.free_page_count(), before_free);
    }

    #[test]
    fn remap_is_rejected() {
        let (mut fa, mut space) = setup();
        let phys = fa.allocate_page().unwrap();
        space.map_page(&mut fa, 0x5000_0000, phys, RW).unwrap();
        assert_eq!(
            space.map_page(&mut fa, 0x5000_0000, phys, RW),
            Err(MemoryError::AlreadyMapped)
        );
    }

    #[test]
    fn unmap_of_unmapped_is_not_mapped() {
        let (mut fa, mut space) = setup();
        assert_eq!(
            space.unmap_page(&mut fa, 0x5000_0000),
            Err(MemoryError::NotMapped)
        );
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let (mut fa, mut space) = setup();
        let phys = fa.allocate_page().unwrap();
        assert_eq!(
            space.map_page(&mut fa, 0x5000_0800, phys, RW),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            space.map_page(&mut fa, 0x5000_0000, phys + 0x10, RW),
            Err(MemoryError::InvalidArgument)
        );
        assert_eq!(
            space.unmap_page(&mut fa, 0x123),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test]
    fn shared_leaves_keep_neighbor_tables() {
        let (mut fa, mut space) = setup();
        let p1 = fa.allocate_page().unwrap();
        let p2 = fa.allocate_page().unwrap();
        // Two pages in the same PT.
        space.map_page(&mut fa, 0x5000_0000, p1, RW).unwrap();
        space.map_page(&mut fa, 0x5000_1000, p2, RW).unwrap();

        space.unmap_page(&mut fa, 0x5000_0000).unwrap();
        // The PT still holds p2, so nothing was pruned.
        assert_eq!(space.translate(0x5000_1000), Some(p2));

        space.unmap_page(&mut fa, 0x5000_1000).unwrap();
        assert_eq!(space.table_pages(), 0);
    }

    #[test]
    fn map_pages_unwinds_on_failure() {
        let (mut fa, mut space) = setup();
        let base = fa.allocate_pages(4).unwrap();

        // Occupy the middle of the target range.
        let squatter = fa.allocate_page().unwrap();
        space.map_page(&mut fa, 0x5000_2000, squatter, RW).unwrap();
        let mapped_before = space.mapped_pages();

        // The range collides at its third page; the first two must be
        // unwound.
        assert_eq!(
            space.map_pages(&mut fa, 0x5000_0000, base, 4, RW),
            Err(MemoryError::AlreadyMapped)
        );
        assert_eq!(space.mapped_pages(), mapped_before);
        assert_eq!(space.translate(0x5000_0000), None);
        assert_eq!(space.translate(0x5000_1000), None);

        // A clean range maps whole and unmaps whole.
        let fresh = fa.allocate_pages(4).unwrap();
        space.map_pages(&mut fa, 0x6000_0000, fresh, 4, RW).unwrap();
        for i in 0..4u64 {
            assert_eq!(
                space.translate(0x6000_0000 + i * 0x1000),
                Some(fresh + i * 0x1000)
            );
        }
        space.unmap_pages(&mut fa, 0x6000_0000, 4).unwrap();
        assert_eq!(space.translate(0x6000_0000), None);
    }

    #[test]
    fn user_space_shares_kernel_higher_half() {
        let (mut fa, mut kernel) = setup();
        let phys = fa.allocate_page().unwrap();
        let virt = 0xFFFF_8000_1000_0000u64;
        kernel.map_page(&mut fa, virt, phys, RW).unwrap();

        let user = AddressSpace::new_user(&mut fa, &kernel).unwrap();
        assert_eq!(user.translate(virt), Some(phys));

        // Kernel-half growth below the PML4 level stays visible: the
        // shared slot points at the same PDPT.
        let phys2 = fa.allocate_page().unwrap();
        kernel.map_page(&mut fa, virt + 0x1000, phys2, RW).unwrap();
        assert_eq!(user.translate(virt + 0x1000), Some(phys2));
    }

    #[test]
    fn user_half_is_private() {
        let (mut fa, kernel) = setup();
        let mut user = AddressSpace::new_user(&mut fa, &kernel).unwrap();
        let phys = fa.allocate_page().unwrap();
        user.map_page(&mut fa, 0x40_0000, phys, RW).unwrap();
        assert_eq!(kernel.translate(0x40_0000), None);
    }

    #[test]
    fn destroy_returns_all_user_frames() {
        let (mut fa, kernel) = setup();
        let baseline = fa.free_page_count();

        let mut user = AddressSpace::new_user(&mut fa, &kernel).unwrap();
        for i in 0..4u64 {
            let phys = fa.allocate_page().unwrap();
            user.map_page(&mut fa, 0x40_0000 + i * 0x1000, phys, RW)
                .unwrap();
        }
        assert!(fa.free_page_count() < baseline);

        user.destroy_user_half(&mut fa);
        assert_eq!(fa.free_page_count(), baseline);
    }

    #[test]
    fn huge_page_translation_adds_offset() {
        let (mut fa, mut space) = setup();
        // Build PML4 -> PDPT -> PD by mapping a neighbor page, then plant
        // a 2 MiB huge leaf in the PD.
        let phys = fa.allocate_page().unwrap();
        space.map_page(&mut fa, 0x4000_0000, phys, RW).unwrap();

        let huge_virt = 0x4020_0000u64; // next PD slot
        let huge_frame = 0x20_0000u64;
        let idx = table_indices(huge_virt);
        let pml4 = unsafe { table_mut(space.pml4_phys) };
        let pdpt = pml4[idx[3]].addr().unwrap();
        let pd = unsafe { table_mut(pdpt) }[idx[2]].addr().unwrap();
        (unsafe { table_mut(pd) })[idx[1]].set(huge_frame, RW | PageFlags::HUGE_PAGE);

        assert_eq!(
            space.translate(huge_virt + 0x1234),
            Some(huge_frame + 0x1234)
        );
    }

    #[test]
    fn entry_flag_accessors() {
        let mut entry = PageTableEntry::empty();
        assert!(entry.is_unused());
        assert_eq!(entry.addr(), None);

        entry.set(0x1000, RW | PageFlags::GLOBAL);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.addr(), Some(0x1000));
        assert!(entry.flags().contains(PageFlags::GLOBAL));

        entry.set_unused();
        assert!(entry.is_unused());
    }

    #[test]
    fn index_extraction() {
        let idx = table_indices(0xFFFF_8000_0000_0000);
        assert_eq!(idx[3], 256);
        let idx = table_indices(0x0000_7FFF_FFFF_F000);
        assert_eq!(idx[3], 255);
        assert_eq!(idx[0], 511);
    }
}
