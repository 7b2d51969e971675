//! Legacy 8259 PIC pair, remapped above the exception vectors.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the primary PIC after remapping.
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const KEYBOARD_VECTOR: u8 = PIC_1_OFFSET + 1;

static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PICs and unmask the timer and keyboard lines.
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Mask everything except IRQ0 (timer) and IRQ1 (keyboard).
        pics.write_masks(0b1111_1100, 0b1111_1111);
    }
    log::info!("PIC remapped to vectors {}..{}", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

/// Acknowledge an interrupt so the line can fire again.
pub fn end_of_interrupt(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}
