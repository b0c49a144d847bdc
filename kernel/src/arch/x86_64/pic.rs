//! Legacy 8259 PIC pair.
//!
//! IRQs 0-15 are remapped to vectors 32-47 (the power-on offsets
//! collide with CPU exceptions). The init sequence saves and restores
//! the interrupt masks, then IRQ0 (timer) and IRQ1 (keyboard) are
//! unmasked. Spurious IRQ 7/15 detection reads the in-service
//! register, which the `pic8259` crate does not expose.

use pic8259::ChainedPics;
use x86_64::instructions::port::Port;

use crate::sync::IrqMutex;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

const PIC_1_COMMAND: u16 = 0x20;
const PIC_2_COMMAND: u16 = 0xA0;

/// OCW3: next command-port read returns the in-service register.
const OCW3_READ_ISR: u8 = 0x0B;

static PICS: IrqMutex<ChainedPics> =
    IrqMutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap both controllers (`initialize` restores the saved masks),
/// then unmask the timer and keyboard lines.
pub fn init() {
    unsafe {
        PICS.lock().initialize();
    }
    unmask(0);
    unmask(1);
}

/// Clear the mask bit for one IRQ line.
pub fn unmask(irq: u8) {
    let mut pics = PICS.lock();
    let [mut master, mut slave] = unsafe { pics.read_masks() };
    if irq < 8 {
        master &= !(1 << irq);
    } else {
        slave &= !(1 << (irq - 8));
        // Cascade line must be open for slave IRQs.
        master &= !(1 << 2);
    }
    unsafe { pics.write_masks(master, slave) };
}

/// Set the mask bit for one IRQ line.
pub fn mask(irq: u8) {
    let mut pics = PICS.lock();
    let [mut master, mut slave] = unsafe { pics.read_masks() };
    if irq < 8 {
        master |= 1 << irq;
    } else {
        slave |= 1 << (irq - 8);
    }
    unsafe { pics.write_masks(master, slave) };
}

/// Acknowledge a handled IRQ: master always, slave too for irq >= 8.
pub fn end_of_interrupt(irq: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}

/// A spurious IRQ 7/15 raises the vector without setting the
/// in-service bit. Callers must not EOI the originating controller;
/// for a spurious slave IRQ the master still saw the cascade and
/// needs its EOI.
pub fn is_spurious(irq: u8) -> bool {
    if irq != 7 && irq != 15 {
        return false;
    }
    let command = if irq < 8 { PIC_1_COMMAND } else { PIC_2_COMMAND };
    let mut port: Port<u8> = Port::new(command);
    let isr = unsafe {
        port.write(OCW3_READ_ISR);
        port.read()
    };
    isr & 0x80 == 0
}

/// EOI path for a suppressed spurious IRQ.
pub fn spurious_eoi(irq: u8) {
    if irq == 15 {
        let mut master: Port<u8> = Port::new(PIC_1_COMMAND);
        unsafe { master.write(0x20) };
    }
    // Spurious IRQ7: no EOI at all.
}
