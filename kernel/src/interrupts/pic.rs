//! Programmable Interrupt Controller (8259 PIC) driver.
//!
//! The legacy PIC pair is remapped so hardware IRQs do not collide with
//! CPU exception vectors.

use pic8259::ChainedPics;
use spin::Mutex;

/// PIC1 offset (IRQ 0-7 mapped to interrupts 32-39).
const PIC1_OFFSET: u8 = 32;

/// PIC2 offset (IRQ 8-15 mapped to interrupts 40-47).
const PIC2_OFFSET: u8 = 40;

/// The chained PICs (master and slave).
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET) });

/// Initialize and remap the PICs.
pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
}

/// Send end-of-interrupt for the given vector.
pub fn end_of_interrupt(interrupt_id: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(interrupt_id);
    }
}
