//! Message tags
//!
//! The first word of a mailbox message is its tag. Tags with the high
//! bit set are reserved for the system; tags in the top 64 KiB of the
//! value space deliver hardware interrupts.

/// Tags with this bit set are reserved for system use
pub const SYSTEM_FLAG: u64 = 0x8000_0000_0000_0000;

/// The invalid tag
pub const INVALID: u64 = 0;

/// Base of the IRQ delivery range: if all bits above the low 16 are
/// set, the tag encodes an interrupt vector.
pub const IRQ_BASE: u64 = 0xffff_ffff_ffff_0000;

/// True if the tag encodes an IRQ delivery.
#[inline]
pub const fn is_irq(tag: u64) -> bool {
    tag & IRQ_BASE == IRQ_BASE
}

/// The delivery tag for a hardware vector.
#[inline]
pub const fn from_irq(vector: u16) -> u64 {
    vector as u64 | IRQ_BASE
}

/// The hardware vector encoded in an IRQ tag.
#[inline]
pub const fn to_irq(tag: u64) -> u16 {
    (tag & !IRQ_BASE) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_round_trip() {
        let tag = from_irq(0x30);
        assert_eq!(tag, 0xffff_ffff_ffff_0030);
        assert!(is_irq(tag));
        assert_eq!(to_irq(tag), 0x30);
        assert!(tag & SYSTEM_FLAG != 0);
    }

    #[test]
    fn ordinary_tags_are_not_irqs() {
        assert!(!is_irq(0));
        assert!(!is_irq(0x1234));
        assert!(!is_irq(SYSTEM_FLAG | 7));
    }
}
