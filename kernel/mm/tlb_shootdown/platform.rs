//! Everything the shootdown coordinator needs from the machine it runs on.

use bitflags::bitflags;
use cpu_local::CpuSet;
use tlb_ops::LocalFlush;

/// Dense logical processor index, `< cpu_local::MAX_CPUS`.
pub type CpuId = usize;

bitflags! {
    /// Optional hardware capabilities that change how a round is executed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFeatures: u32 {
        /// The TLB can hold global entries (CR4.PGE). Without it the global
        /// PTE bit is ignored.
        const GLOBAL_PAGES = 1 << 0;
        /// The interrupt controller can address "all but self" in one send.
        const BROADCAST_IPI = 1 << 1;
    }
}

/// Opaque saved interrupt priority, returned by [`TlbPlatform::raise_ipl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IplCookie(pub u64);

/// Machine binding for [`super::TlbShootdown`].
///
/// Every method is called with preemption disabled on the calling CPU, and
/// [`handle_ipi`](super::TlbShootdown::handle_ipi) may call
/// [`invalidate`](TlbPlatform::invalidate) from hard interrupt context, so
/// implementations must not block.
pub trait TlbPlatform: Sync {
    /// Logical index of the executing processor.
    fn current_cpu(&self) -> CpuId;

    /// Processors that have finished bring-up and can take the shootdown IPI.
    fn running_cpus(&self) -> CpuSet;

    /// Number of processors the machine may ever bring online.
    fn ncpu(&self) -> usize;

    fn features(&self) -> TlbFeatures;

    /// Whether the executing processor can currently be preempted or migrated.
    fn preemption_disabled(&self) -> bool;

    /// Block delivery of the shootdown IPI (and anything below it) on this
    /// processor, returning the previous level.
    fn raise_ipl(&self) -> IplCookie;

    /// Return to a level saved by [`raise_ipl`](TlbPlatform::raise_ipl).
    /// Pending shootdown IPIs may be taken here.
    fn restore_ipl(&self, cookie: IplCookie);

    /// Post the shootdown IPI to one processor.
    fn send_shootdown_ipi(&self, cpu: CpuId);

    /// Post the shootdown IPI to every running processor except this one.
    ///
    /// Only called when [`TlbFeatures::BROADCAST_IPI`] is advertised.
    fn broadcast_shootdown_ipi(&self);

    /// Discard cached translations on the executing processor.
    fn invalidate(&self, op: LocalFlush);

    /// Called once per backoff step while spinning on the mailbox.
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }
}
