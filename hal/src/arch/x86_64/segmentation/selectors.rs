//! # Segment Selectors
//!
//! Type-safe selectors for the fixed GDT layout.
//!
//! ```text
//! Index  Selector  Segment
//! ─────────────────────────────────
//! 0      0x00      Null
//! 1      0x08      Kernel Code
//! 2      0x10      Kernel Data
//! 3      0x18      User Data
//! 4      0x20      User Code
//! 5-6    0x28      TSS (16 bytes)
//! ─────────────────────────────────
//! ```
//!
//! User data sits below user code so that the STAR MSR's SYSRET selector
//! pairing works without holes.

use core::fmt;

/// Requested privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rpl {
    /// Ring 0 (kernel)
    Ring0 = 0,
    /// Ring 3 (user)
    Ring3 = 3,
}

/// A 16-bit GDT selector.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    /// The null selector.
    pub const NULL: Self = Self(0);

    /// Build a selector from a GDT index and RPL.
    pub const fn new(index: u16, rpl: Rpl) -> Self {
        Self((index << 3) | rpl as u16)
    }

    /// Raw selector value.
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// GDT index.
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Requested privilege level.
    pub const fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }
}

impl fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentSelector({:#06x})", self.0)
    }
}

/// Kernel code segment (0x08).
pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, Rpl::Ring0);
/// Kernel data segment (0x10).
pub const KERNEL_DS: SegmentSelector = SegmentSelector::new(2, Rpl::Ring0);
/// User data segment (0x18, RPL 3).
pub const USER_DS: SegmentSelector = SegmentSelector::new(3, Rpl::Ring3);
/// User code segment (0x20, RPL 3).
pub const USER_CS: SegmentSelector = SegmentSelector::new(4, Rpl::Ring3);
/// TSS descriptor (0x28, spans two slots).
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(5, Rpl::Ring0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_selector_values() {
        assert_eq!(KERNEL_CS.raw(), 0x08);
        assert_eq!(KERNEL_DS.raw(), 0x10);
        assert_eq!(USER_DS.raw(), 0x18 | 3);
        assert_eq!(USER_CS.raw(), 0x20 | 3);
        assert_eq!(TSS_SELECTOR.raw(), 0x28);
    }

    #[test]
    fn test_selector_decomposition() {
        let sel = SegmentSelector::new(4, Rpl::Ring3);
        assert_eq!(sel.index(), 4);
        assert_eq!(sel.rpl(), 3);
    }
}
