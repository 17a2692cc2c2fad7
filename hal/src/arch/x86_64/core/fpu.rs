//! # Extended State Management
//!
//! x87/SSE/AVX state save and restore. The CPU offers two families of
//! instructions for this:
//!
//! - **FXSAVE/FXRSTOR**: fixed 512-byte legacy area, always available in
//!   long mode
//! - **XSAVE/XRSTOR**: variable-size area covering every enabled state
//!   component, sized by CPUID leaf 0DH
//!
//! [`save_extended_state`] and [`restore_extended_state`] pick XSAVE with
//! an all-ones component mask when the CPU supports it and fall back to
//! FXSAVE otherwise. Callers own the buffer: 64-byte aligned, at least
//! [`extended_state_size`] bytes.

use core::arch::asm;
use core::mem::size_of;

use super::cpuid;

// =============================================================================
// Constants
// =============================================================================

/// Size of the legacy FXSAVE area.
pub const FXSAVE_AREA_SIZE: usize = 512;

/// Required buffer alignment for both save families.
pub const EXTENDED_STATE_ALIGN: usize = 64;

/// Component mask selecting every enabled state component.
const XSAVE_ALL_COMPONENTS: u64 = u64::MAX;

// =============================================================================
// FXSAVE Area
// =============================================================================

/// FXSAVE/FXRSTOR area (legacy 512-byte format).
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct FxSaveArea {
    /// x87 control word
    pub fcw: u16,
    /// x87 status word
    pub fsw: u16,
    /// x87 tag word (abridged)
    pub ftw: u8,
    _reserved1: u8,
    /// x87 opcode
    pub fop: u16,
    /// x87 instruction pointer
    pub fip: u64,
    /// x87 data pointer
    pub fdp: u64,
    /// SSE control and status
    pub mxcsr: u32,
    /// Valid MXCSR bits
    pub mxcsr_mask: u32,
    /// ST0-ST7 / MM0-MM7
    pub st_mm: [[u8; 16]; 8],
    /// XMM0-XMM15
    pub xmm: [[u8; 16]; 16],
    _reserved2: [u8; 96],
}

impl FxSaveArea {
    /// Default x87 control word: all exceptions masked, 64-bit precision.
    pub const DEFAULT_FCW: u16 = 0x037F;
    /// Default MXCSR: all SSE exceptions masked.
    pub const DEFAULT_MXCSR: u32 = 0x1F80;

    /// Fresh area with architectural reset values.
    pub const fn new() -> Self {
        Self {
            fcw: Self::DEFAULT_FCW,
            fsw: 0,
            ftw: 0,
            _reserved1: 0,
            fop: 0,
            fip: 0,
            fdp: 0,
            mxcsr: Self::DEFAULT_MXCSR,
            mxcsr_mask: 0,
            st_mm: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            _reserved2: [0; 96],
        }
    }
}

impl Default for FxSaveArea {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::const_assert_eq!(size_of::<FxSaveArea>(), FXSAVE_AREA_SIZE);

// =============================================================================
// Size Query
// =============================================================================

/// Byte size a caller must reserve for one extended-state area.
///
/// With XSAVE available this is the CPUID.0DH maximum across all
/// components the CPU implements; otherwise the fixed FXSAVE size.
pub fn extended_state_size() -> usize {
    if cpuid::features().xsave {
        let leaf = cpuid::cpuid_subleaf(0x0D, 0);
        // ECX = size needed for every component the CPU supports.
        let size = leaf.ecx as usize;
        if size >= FXSAVE_AREA_SIZE {
            return size;
        }
    }
    FXSAVE_AREA_SIZE
}

// =============================================================================
// Save / Restore
// =============================================================================

/// Save the full extended state into `area`.
///
/// # Safety
///
/// `area` must be 64-byte aligned and at least [`extended_state_size`]
/// bytes. With XSAVE in use, CR4.OSXSAVE and XCR0 must already be
/// configured.
#[inline]
pub unsafe fn save_extended_state(area: *mut u8) {
    debug_assert_eq!(area as usize % EXTENDED_STATE_ALIGN, 0);
    if cpuid::features().xsave {
        let lo = XSAVE_ALL_COMPONENTS as u32;
        let hi = (XSAVE_ALL_COMPONENTS >> 32) as u32;
        unsafe {
            asm!(
                "xsave64 [{}]",
                in(reg) area,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags),
            );
        }
    } else {
        unsafe {
            asm!("fxsave64 [{}]", in(reg) area, options(nostack, preserves_flags));
        }
    }
}

/// Restore the full extended state from `area`.
///
/// # Safety
///
/// Same buffer requirements as [`save_extended_state`], and the area must
/// contain state previously written by the matching save instruction.
#[inline]
pub unsafe fn restore_extended_state(area: *const u8) {
    debug_assert_eq!(area as usize % EXTENDED_STATE_ALIGN, 0);
    if cpuid::features().xsave {
        let lo = XSAVE_ALL_COMPONENTS as u32;
        let hi = (XSAVE_ALL_COMPONENTS >> 32) as u32;
        unsafe {
            asm!(
                "xrstor64 [{}]",
                in(reg) area,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags),
            );
        }
    } else {
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) area, options(nostack, preserves_flags));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fxsave_area_layout() {
        assert_eq!(size_of::<FxSaveArea>(), 512);
        assert_eq!(core::mem::align_of::<FxSaveArea>(), 64);
    }

    #[test]
    fn test_extended_state_size_floor() {
        // Never smaller than the legacy area, whatever the host reports.
        assert!(extended_state_size() >= FXSAVE_AREA_SIZE);
    }

    #[test]
    fn test_fxsave_defaults() {
        let area = FxSaveArea::new();
        assert_eq!(area.fcw, FxSaveArea::DEFAULT_FCW);
        assert_eq!(area.mxcsr, FxSaveArea::DEFAULT_MXCSR);
    }
}
