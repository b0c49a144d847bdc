//! Registered-handler table for IRQ lines 2-15.
//!
//! IRQ0 (timer) and IRQ1 (keyboard) are routed directly by the demux
//! in `idt::on_irq`; everything else goes through this table. An IRQ
//! without a registered handler is dropped silently (the demux still
//! sends the EOI).

use crate::sync::IrqMutex;

pub type IrqHandler = fn();

const IRQ_LINES: usize = 16;

static HANDLERS: IrqMutex<[Option<IrqHandler>; IRQ_LINES]> = IrqMutex::new([None; IRQ_LINES]);

pub fn init() {
    let mut handlers = HANDLERS.lock();
    *handlers = [None; IRQ_LINES];
}

/// Register a handler for one IRQ line.
pub fn install(irq: u8, handler: IrqHandler) -> Result<(), &'static str> {
    if irq as usize >= IRQ_LINES {
        return Err("irq line out of range");
    }
    HANDLERS.lock()[irq as usize] = Some(handler);
    Ok(())
}

/// Remove a previously registered handler.
pub fn uninstall(irq: u8) -> Result<(), &'static str> {
    if irq as usize >= IRQ_LINES {
        return Err("irq line out of range");
    }
    HANDLERS.lock()[irq as usize] = None;
    Ok(())
}

/// Invoke the handler for one line, if any. The handler runs outside
/// the table lock so it may install/uninstall itself.
pub fn dispatch(irq: u8) {
    let handler = match irq as usize {
        line if line < IRQ_LINES => HANDLERS.lock()[line],
        _ => None,
    };
    if let Some(handler) = handler {
        handler();
    }
}
