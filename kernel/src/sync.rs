//! Interrupt-masking spinlocks.
//!
//! Every process-wide singleton (heap, scheduler arena, permission
//! table, message bus) is mutated both from tasks and from IRQ
//! handlers on the same core, so a plain spinlock is not enough: the
//! critical section must also run with interrupts masked, or a timer
//! preemption could observe a half-updated structure. `IrqMutex`
//! saves the interrupt flag, disables interrupts, takes the lock, and
//! restores the previous state on drop.
//!
//! On the host (tests) there is no interrupt flag to mask and the
//! type degrades to a plain spinlock.

use core::ops::{Deref, DerefMut};

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        #[inline]
        fn irq_save_and_disable() -> bool {
            let enabled = x86_64::instructions::interrupts::are_enabled();
            x86_64::instructions::interrupts::disable();
            enabled
        }

        #[inline]
        fn irq_restore(enabled: bool) {
            if enabled {
                x86_64::instructions::interrupts::enable();
            }
        }

        /// Halt until the next interrupt.
        #[inline]
        pub fn wait_for_interrupt() {
            x86_64::instructions::hlt();
        }
    } else {
        #[inline]
        fn irq_save_and_disable() -> bool {
            false
        }

        #[inline]
        fn irq_restore(_enabled: bool) {}

        #[inline]
        pub fn wait_for_interrupt() {
            core::hint::spin_loop();
        }
    }
}

pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

pub struct IrqMutexGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    irqs_were_enabled: bool,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disable interrupts, then spin for the lock. The saved interrupt
    /// state is restored after the guard (and thus the lock) is gone.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irqs_were_enabled = irq_save_and_disable();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            irqs_were_enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken")
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        self.guard.take();
        irq_restore(self.irqs_were_enabled);
    }
}
