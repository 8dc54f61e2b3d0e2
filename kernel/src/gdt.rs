//! GDT (Global Descriptor Table) initialization.
//!
//! Long mode mostly ignores segmentation, but the TSS is still required for
//! ring transitions and the interrupt stack table.  The double-fault
//! handler gets a dedicated IST stack so a kernel stack overflow cannot
//! take the fault handler down with it.

use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST index for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Kernel code segment selector (Ring 0).
pub const KERNEL_CS: u16 = 0x08;

/// Kernel data segment selector (Ring 0).
pub const KERNEL_DS: u16 = 0x10;

/// Double fault stack size (20 KiB).
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// Static stack for the double fault handler (lives before heap init).
static mut DOUBLE_FAULT_STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

/// Task State Segment; RSP0 is updated when switching kernel stacks.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();

        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let tss_selector =
            gdt.append(Descriptor::tss_segment(unsafe { &*core::ptr::addr_of!(TSS) }));

        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_data_selector,
                user_code_selector,
                tss_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    #[allow(dead_code)]
    data_selector: SegmentSelector,
    #[allow(dead_code)]
    user_data_selector: SegmentSelector,
    #[allow(dead_code)]
    user_code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Initialize and load the GDT.  Must run before the IDT so the TSS is in
/// place when fault handlers are installed.
pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS};
    use x86_64::instructions::tables::load_tss;

    unsafe {
        let stack_start = VirtAddr::from_ptr(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
        let stack_end = stack_start + DOUBLE_FAULT_STACK_SIZE as u64;
        (*core::ptr::addr_of_mut!(TSS)).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            stack_end;
    }

    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Set the kernel stack pointer loaded on ring transitions (TSS.RSP0).
///
/// # Safety
///
/// `stack_top` must point to a valid, mapped kernel stack.
pub unsafe fn set_kernel_stack(stack_top: VirtAddr) {
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = stack_top;
    }
}
