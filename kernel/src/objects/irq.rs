//! IRQ binding objects
//!
//! An IRQ object is a capability-protected binding between a hardware
//! vector and a mailbox: when the vector fires, the kernel enqueues a
//! message tagged `tags::from_irq(vector)` with no payload into the
//! bound mailbox, and the server receives it like any other call (with
//! no caller to reply to).
//!
//! Bindings are created through the system object; the interrupt
//! controller programming behind them is arch territory.

use j6::Koid;

/// A vector-to-mailbox binding.
pub struct IrqBinding {
    vector: u16,
    mailbox: Koid,
}

impl IrqBinding {
    pub fn new(vector: u16, mailbox: Koid) -> Self {
        Self { vector, mailbox }
    }

    #[inline]
    pub fn vector(&self) -> u16 {
        self.vector
    }

    #[inline]
    pub fn mailbox(&self) -> Koid {
        self.mailbox
    }
}

impl core::fmt::Debug for IrqBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqBinding")
            .field("vector", &format_args!("{:#x}", self.vector))
            .field("mailbox", &self.mailbox)
            .finish()
    }
}
