//! TLB Operations Library for x86_64
//!
//! Low-level local TLB invalidation primitives. This is the leaf that the
//! cross-processor shootdown coordinator in `mm` drives on every processor it
//! targets: the requester for its own TLB, and the IPI handler on each remote
//! one.
//!
//! # Architecture
//!
//! [`LocalFlush`] describes *what* to discard and is available on every
//! target so the coordinator can be tested hosted. The instructions that carry
//! it out are compiled only for `x86_64`.
//!
//! # INVPCID Types
//!
//! Only the all-context types are used; single pages go through INVLPG.
//!
//! | Type | Name | Description |
//! |------|------|-------------|
//! | 2 | All-context | Invalidate all non-global mappings (all PCIDs) |
//! | 3 | All-context-global | Invalidate all mappings including globals |
//!
//! # Safety
//!
//! All instruction wrappers are unsafe as they directly modify CPU TLB state
//! and must run at CPL 0.

#![cfg_attr(not(test), no_std)]

use x86_64::VirtAddr;

/// One local invalidation, as requested by a shootdown ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFlush {
    /// Discard the translation for one page of the current address space.
    ///
    /// INVLPG also drops a global entry for that address.
    Page(VirtAddr),
    /// Discard every non-global translation.
    AllNonGlobal,
    /// Discard every translation, global entries included.
    AllIncludingGlobal,
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use core::arch::asm;
    use core::sync::atomic::{AtomicBool, Ordering};

    use x86_64::registers::control::{Cr4, Cr4Flags};
    use x86_64::VirtAddr;

    use super::LocalFlush;

    static INVPCID_CACHED: AtomicBool = AtomicBool::new(false);
    static INVPCID_CHECKED: AtomicBool = AtomicBool::new(false);

    /// Check if INVPCID instruction is supported.
    ///
    /// Queries CPUID.(EAX=07H, ECX=0):EBX[10] once and caches the answer.
    #[inline]
    pub fn invpcid_supported() -> bool {
        // Acquire pairs with the Release store of INVPCID_CHECKED below
        if INVPCID_CHECKED.load(Ordering::Acquire) {
            return INVPCID_CACHED.load(Ordering::Relaxed);
        }

        // Safety: CPUID leaf 7 is available on every x86_64 CPU
        let ebx = unsafe { core::arch::x86_64::__cpuid_count(7, 0).ebx };
        let supported = (ebx & (1 << 10)) != 0;

        INVPCID_CACHED.store(supported, Ordering::Relaxed);
        INVPCID_CHECKED.store(true, Ordering::Release);

        supported
    }

    /// Whether CR4.PGE is set, i.e. the TLB may hold global entries.
    #[inline]
    pub fn global_pages_enabled() -> bool {
        Cr4::read().contains(Cr4Flags::PAGE_GLOBAL)
    }

    /// INVPCID descriptor. Both fields are ignored by types 2 and 3 but the
    /// instruction still reads all 16 bytes.
    #[repr(C, packed)]
    pub(crate) struct InvpcidDescriptor {
        pub(crate) pcid: u64,
        pub(crate) address: u64,
    }

    /// # Safety
    ///
    /// INVPCID must be supported, the PCID must be 0-4095 and `typ` 0-3.
    #[inline(always)]
    unsafe fn invpcid(desc: &InvpcidDescriptor, typ: u64) {
        asm!(
            "invpcid {typ}, [{desc}]",
            desc = in(reg) desc,
            typ = in(reg) typ,
            options(nostack, preserves_flags),
        );
    }

    /// Invalidate all non-global translations for all PCIDs (type 2).
    ///
    /// # Safety
    ///
    /// Caller must ensure INVPCID is supported.
    #[inline(always)]
    pub unsafe fn invpcid_all_nonglobal() {
        let desc = InvpcidDescriptor { pcid: 0, address: 0 };
        invpcid(&desc, 2);
    }

    /// Invalidate all translations including global entries (type 3).
    ///
    /// # Safety
    ///
    /// Caller must ensure INVPCID is supported.
    #[inline(always)]
    pub unsafe fn invpcid_all_global() {
        let desc = InvpcidDescriptor { pcid: 0, address: 0 };
        invpcid(&desc, 3);
    }

    /// INVLPG: drop the translation for `addr` in the current context.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0.
    #[inline(always)]
    pub unsafe fn invlpg(addr: VirtAddr) {
        asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
    }

    /// Reload CR3, discarding every non-global translation.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0.
    #[inline(always)]
    pub unsafe fn reload_cr3() {
        let cr3: u64;
        asm!("mov {}, cr3", out(reg) cr3, options(nostack, preserves_flags));
        asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }

    /// Flush all non-global TLB entries using the best available method.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0.
    pub unsafe fn flush_all_nonglobal() {
        if invpcid_supported() {
            invpcid_all_nonglobal();
        } else {
            reload_cr3();
        }
    }

    /// Flush every TLB entry, global ones included.
    ///
    /// Without INVPCID, toggling CR4.PGE off and on discards global entries.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0 with interrupts masked high enough that nothing on
    /// this CPU observes CR4 between the two writes.
    pub unsafe fn flush_all_global() {
        if invpcid_supported() {
            invpcid_all_global();
            return;
        }
        let cr4 = Cr4::read();
        if cr4.contains(Cr4Flags::PAGE_GLOBAL) {
            Cr4::write(cr4 - Cr4Flags::PAGE_GLOBAL);
            Cr4::write(cr4);
        } else {
            reload_cr3();
        }
    }

    /// Carry out one [`LocalFlush`] on the executing CPU.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0; see [`flush_all_global`] for the interrupt level.
    pub unsafe fn flush_local(op: LocalFlush) {
        match op {
            LocalFlush::Page(va) => invlpg(va),
            LocalFlush::AllNonGlobal => flush_all_nonglobal(),
            LocalFlush::AllIncludingGlobal => flush_all_global(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86::{
    flush_all_global, flush_all_nonglobal, flush_local, global_pages_enabled, invlpg,
    invpcid_all_global, invpcid_all_nonglobal, invpcid_supported, reload_cr3,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_invpcid_descriptor_layout() {
        // The instruction reads exactly 16 bytes with no alignment requirement
        assert_eq!(core::mem::size_of::<x86::InvpcidDescriptor>(), 16);
        assert_eq!(core::mem::align_of::<x86::InvpcidDescriptor>(), 1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_invpcid_support_is_cached() {
        // CPUID is unprivileged; the answer must be stable across calls
        let first = invpcid_supported();
        assert_eq!(first, invpcid_supported());
    }
}
