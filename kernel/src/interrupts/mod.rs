//! Interrupt handling subsystem.
//!
//! Sets up the Interrupt Descriptor Table and the legacy 8259 PIC, and
//! routes the 1 kHz timer interrupt into the scheduler.  Interrupts are the
//! only source of asynchrony visible to kernel code; handlers never
//! suspend and only take interrupt-safe spinlocks.

mod pic;

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::gdt;

/// Hardware interrupt vectors after PIC remapping.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = 32,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.breakpoint.set_handler_fn(breakpoint_handler);

        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);

        idt[InterruptIndex::Timer.as_u8()].set_handler_fn(timer_interrupt_handler);

        idt
    };
}

/// Initialize the IDT and the PIC.  Interrupts stay disabled until
/// [`enable`] is called after the core subsystems are up.
pub fn init() {
    IDT.load();
    pic::init();
}

/// Enable interrupts on this CPU.
pub fn enable() {
    x86_64::instructions::interrupts::enable();
}

/// Halt loop; the CPU parks here between interrupts.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::warning!("INT", "breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    crate::error!(
        "INT",
        "page fault at {:?}, error {:?}, rip {:#x}",
        Cr2::read(),
        error_code,
        stack_frame.instruction_pointer.as_u64()
    );
    panic!("unhandled page fault");
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault (error {:#x})\n{:#?}",
        error_code, stack_frame
    );
}

/// Timer tick: advance the coarse clock, then give the scheduler its
/// preemption point.
extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::time::tick();
    crate::scheduler::on_timer_tick();
    pic::end_of_interrupt(InterruptIndex::Timer.as_u8());
}
