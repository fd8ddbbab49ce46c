//! Which processors may hold translations for which address space.
//!
//! A [`Residency`] lives inside each user address space and is maintained by
//! context-switch code. The shootdown coordinator reads it to pick targets
//! and, from the IPI handler, removes LAZY processors from it.
//!
//! # TLB State Machine
//!
//! ```text
//!   activate()          deactivate_lazy()        IPI handler
//! ───────────► ACTIVE ───────────────────► LAZY ─────────────► STALE
//!                ▲                           │                   │
//!                └──────── activate() ───────┴──── activate() ───┘
//! ```
//!
//! A LAZY processor still has the user space loaded but is running kernel
//! code. Instead of flushing on every shootdown it drops out of the resident
//! set on the first one and becomes STALE; it must flush before it touches
//! that space again, which [`CpuTlb::activate`] reports.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use cpu_local::{AtomicCpuSet, CpuSet};

use super::platform::CpuId;

/// Per-processor TLB residency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlbState {
    /// Running in the loaded address space.
    Active = 0,
    /// Address space loaded but not in use; invalidations may be deferred.
    Lazy = 1,
    /// Dropped from the resident set; cached translations are untrusted.
    Stale = 2,
}

impl TlbState {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TlbState::Active,
            1 => TlbState::Lazy,
            _ => TlbState::Stale,
        }
    }
}

/// Resident-processor bookkeeping for one user address space.
#[derive(Debug)]
pub struct Residency {
    /// Processors that may cache user translations of this space.
    cpus: AtomicCpuSet,
    /// Processors that may cache its kernel-half translations.
    kernel_cpus: AtomicCpuSet,
    tearing_down: AtomicBool,
}

impl Residency {
    pub const fn new() -> Self {
        Self {
            cpus: AtomicCpuSet::new(CpuSet::EMPTY),
            kernel_cpus: AtomicCpuSet::new(CpuSet::EMPTY),
            tearing_down: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn cpus(&self) -> CpuSet {
        self.cpus.load(Ordering::Acquire)
    }

    #[inline]
    pub fn kernel_cpus(&self) -> CpuSet {
        self.kernel_cpus.load(Ordering::Acquire)
    }

    /// Record that `cpu` loaded this space.
    pub fn mark_resident(&self, cpu: CpuId) {
        self.cpus.insert(cpu, Ordering::AcqRel);
        self.kernel_cpus.insert(cpu, Ordering::AcqRel);
    }

    /// Record that `cpu` switched to a different space.
    pub fn leave(&self, cpu: CpuId) {
        self.cpus.remove(cpu, Ordering::AcqRel);
        self.kernel_cpus.remove(cpu, Ordering::AcqRel);
    }

    /// Drop `cpu` from the user resident set only. Returns whether it was there.
    pub fn evict(&self, cpu: CpuId) -> bool {
        self.cpus.remove(cpu, Ordering::AcqRel)
    }

    /// Signal that the space is being destroyed. Shootdown requests against
    /// it are dropped from now on; teardown flushes it once at the end.
    pub fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }
}

impl Default for Residency {
    fn default() -> Self {
        Self::new()
    }
}

/// Address space named by a shootdown request.
#[derive(Debug, Clone, Copy)]
pub enum Space<'a> {
    /// The kernel's own space, resident on every running processor.
    Kernel,
    User(&'a Residency),
}

impl Space<'_> {
    #[inline]
    pub fn is_kernel(&self) -> bool {
        matches!(self, Space::Kernel)
    }
}

/// One processor's view: its TLB state and the user space it has loaded.
#[derive(Debug)]
pub struct CpuTlb {
    state: AtomicU8,
    space: AtomicPtr<Residency>,
}

impl CpuTlb {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(TlbState::Active as u8),
            space: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn state(&self) -> TlbState {
        TlbState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The user space currently loaded, if any.
    #[inline]
    pub fn space(&self) -> *const Residency {
        self.space.load(Ordering::Acquire)
    }

    /// Load `space` on processor `cpu` and become ACTIVE.
    ///
    /// Returns the previous state when the processor must flush its
    /// non-global TLB before using `space`: it was STALE, or it is switching
    /// from a different space. Returns `None` when the cached translations are
    /// still trustworthy.
    ///
    /// # Safety
    ///
    /// Must run on `cpu` with the shootdown IPI masked. `space` must stay
    /// alive until this processor activates a different space or calls
    /// [`detach`](Self::detach).
    pub unsafe fn activate(&self, cpu: CpuId, space: &Residency) -> Option<TlbState> {
        let new = space as *const Residency as *mut Residency;
        let prev = self.space.swap(new, Ordering::AcqRel);
        let state = self.state();
        if prev != new {
            if let Some(old) = prev.as_ref() {
                old.leave(cpu);
            }
        }
        space.mark_resident(cpu);
        self.state.store(TlbState::Active as u8, Ordering::Release);

        if prev != new || state == TlbState::Stale {
            Some(state)
        } else {
            None
        }
    }

    /// Stop using the loaded space without unloading it (ACTIVE -> LAZY).
    pub fn deactivate_lazy(&self) {
        let was = self.state.compare_exchange(
            TlbState::Active as u8,
            TlbState::Lazy as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            was.is_ok(),
            "deactivate_lazy from {:?}, expected Active",
            TlbState::from_u8(was.unwrap_or_else(|v| v))
        );
    }

    /// Forget the loaded space (before it is destroyed).
    ///
    /// # Safety
    ///
    /// Must run on `cpu` with the shootdown IPI masked.
    pub unsafe fn detach(&self, cpu: CpuId) {
        let prev = self.space.swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(old) = prev.as_ref() {
            old.leave(cpu);
        }
    }

    /// LAZY -> STALE, called by the IPI handler on `cpu` for a round that
    /// touched a user space. Returns whether the processor was evicted.
    pub(crate) fn evict_lazy(&self, cpu: CpuId) -> bool {
        if self.state() != TlbState::Lazy {
            return false;
        }
        // Safety: activate()'s contract keeps the installed space alive
        if let Some(space) = unsafe { self.space().as_ref() } {
            space.evict(cpu);
        }
        self.state.store(TlbState::Stale as u8, Ordering::Release);
        true
    }
}

impl Default for CpuTlb {
    fn default() -> Self {
        Self::new()
    }
}
