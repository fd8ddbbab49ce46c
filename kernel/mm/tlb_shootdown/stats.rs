//! Shootdown accounting.
//!
//! All counters are Relaxed: they are for debugging/profiling only and never
//! order anything.

use core::sync::atomic::{AtomicU64, Ordering};

/// Page-map call site that asked for an invalidation.
///
/// Has no effect on how the invalidation is carried out; it only feeds the
/// per-reason counters of the `tlbstats` feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlbWhy {
    /// Temporary alternate page-table mapping changed.
    Apte,
    /// Kernel-only mapping entered.
    KEnter,
    /// Kernel-only mapping removed.
    KRemove,
    /// Page-table page freed (first level).
    FreePtp1,
    /// Page-table page freed (upper level).
    FreePtp2,
    RemovePte,
    RemovePtes,
    /// PV entry attributes synced (single mapping).
    SyncPv1,
    /// PV entry attributes synced (all mappings).
    SyncPv2,
    WriteProtect,
    Enter,
    /// Whole-space update after a batch of changes.
    Update,
    BusDma,
    BusSpace,
}

impl TlbWhy {
    /// Number of reasons.
    pub const COUNT: usize = 14;

    /// Every reason, in discriminant order.
    pub const ALL: [TlbWhy; Self::COUNT] = [
        TlbWhy::Apte,
        TlbWhy::KEnter,
        TlbWhy::KRemove,
        TlbWhy::FreePtp1,
        TlbWhy::FreePtp2,
        TlbWhy::RemovePte,
        TlbWhy::RemovePtes,
        TlbWhy::SyncPv1,
        TlbWhy::SyncPv2,
        TlbWhy::WriteProtect,
        TlbWhy::Enter,
        TlbWhy::Update,
        TlbWhy::BusDma,
        TlbWhy::BusSpace,
    ];

    /// Short name used in stats dumps.
    pub const fn name(self) -> &'static str {
        match self {
            TlbWhy::Apte => "apte",
            TlbWhy::KEnter => "kenter",
            TlbWhy::KRemove => "kremove",
            TlbWhy::FreePtp1 => "free_ptp1",
            TlbWhy::FreePtp2 => "free_ptp2",
            TlbWhy::RemovePte => "remove_pte",
            TlbWhy::RemovePtes => "remove_ptes",
            TlbWhy::SyncPv1 => "sync_pv1",
            TlbWhy::SyncPv2 => "sync_pv2",
            TlbWhy::WriteProtect => "write_protect",
            TlbWhy::Enter => "enter",
            TlbWhy::Update => "update",
            TlbWhy::BusDma => "bus_dma",
            TlbWhy::BusSpace => "bus_space",
        }
    }
}

/// Snapshot of one coordinator's counters, returned by
/// [`TlbShootdown::stats`](super::TlbShootdown::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbShootdownStats {
    /// Mailbox rounds started (remote processors were involved)
    pub rounds: u64,
    /// Times the mailbox claim found another round in flight
    pub acquire_contended: u64,
    /// Claims abandoned because an interrupt-level flush drained the ticket
    pub acquire_abandoned: u64,
    /// Unicast shootdown IPIs sent
    pub ipis_unicast: u64,
    /// All-but-self broadcasts sent
    pub ipis_broadcast: u64,
    /// Local single-page invalidations (requester and handlers)
    pub local_page_flushes: u64,
    /// Local whole-TLB invalidations, global entries kept
    pub local_full_flushes: u64,
    /// Local whole-TLB invalidations, global entries included
    pub local_global_flushes: u64,
    /// Remote handler runs
    pub remote_handled: u64,
    /// LAZY processors evicted from a resident set and marked STALE
    pub lazy_evictions: u64,
    /// Requests dropped because the address space was being torn down
    pub dropped_requests: u64,
    /// Requests that pushed a ticket into "everything" mode
    pub overflows: u64,
    /// Single-page requests
    #[cfg(feature = "tlbstats")]
    pub single: u64,
    /// Whole-space requests against a user space
    #[cfg(feature = "tlbstats")]
    pub user_all: u64,
    /// Whole-space requests against the kernel space
    #[cfg(feature = "tlbstats")]
    pub kernel_all: u64,
    /// Requests per [`TlbWhy`], indexed by discriminant
    #[cfg(feature = "tlbstats")]
    pub why: [u64; TlbWhy::COUNT],
}

#[cfg(feature = "tlbstats")]
impl TlbShootdownStats {
    /// Requests attributed to `why`.
    pub fn requests_for(&self, why: TlbWhy) -> u64 {
        self.why[why as usize]
    }
}

/// Live counters embedded in a coordinator.
pub(crate) struct TlbCounters {
    pub(crate) rounds: AtomicU64,
    pub(crate) acquire_contended: AtomicU64,
    pub(crate) acquire_abandoned: AtomicU64,
    pub(crate) ipis_unicast: AtomicU64,
    pub(crate) ipis_broadcast: AtomicU64,
    pub(crate) local_page_flushes: AtomicU64,
    pub(crate) local_full_flushes: AtomicU64,
    pub(crate) local_global_flushes: AtomicU64,
    pub(crate) remote_handled: AtomicU64,
    pub(crate) lazy_evictions: AtomicU64,
    pub(crate) dropped_requests: AtomicU64,
    pub(crate) overflows: AtomicU64,
    #[cfg(feature = "tlbstats")]
    single: AtomicU64,
    #[cfg(feature = "tlbstats")]
    user_all: AtomicU64,
    #[cfg(feature = "tlbstats")]
    kernel_all: AtomicU64,
    #[cfg(feature = "tlbstats")]
    why: [AtomicU64; TlbWhy::COUNT],
}

/// Add one to a counter.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TlbCounters {
    pub(crate) const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            rounds: ZERO,
            acquire_contended: ZERO,
            acquire_abandoned: ZERO,
            ipis_unicast: ZERO,
            ipis_broadcast: ZERO,
            local_page_flushes: ZERO,
            local_full_flushes: ZERO,
            local_global_flushes: ZERO,
            remote_handled: ZERO,
            lazy_evictions: ZERO,
            dropped_requests: ZERO,
            overflows: ZERO,
            #[cfg(feature = "tlbstats")]
            single: ZERO,
            #[cfg(feature = "tlbstats")]
            user_all: ZERO,
            #[cfg(feature = "tlbstats")]
            kernel_all: ZERO,
            #[cfg(feature = "tlbstats")]
            why: [ZERO; TlbWhy::COUNT],
        }
    }

    /// Classify one accepted request.
    #[cfg(feature = "tlbstats")]
    #[inline]
    pub(crate) fn record_request(&self, why: TlbWhy, everything: bool, kernel: bool) {
        bump(&self.why[why as usize]);
        match (everything, kernel) {
            (false, _) => bump(&self.single),
            (true, false) => bump(&self.user_all),
            (true, true) => bump(&self.kernel_all),
        }
    }

    #[cfg(not(feature = "tlbstats"))]
    #[inline(always)]
    pub(crate) fn record_request(&self, _why: TlbWhy, _everything: bool, _kernel: bool) {}

    pub(crate) fn snapshot(&self) -> TlbShootdownStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TlbShootdownStats {
            rounds: load(&self.rounds),
            acquire_contended: load(&self.acquire_contended),
            acquire_abandoned: load(&self.acquire_abandoned),
            ipis_unicast: load(&self.ipis_unicast),
            ipis_broadcast: load(&self.ipis_broadcast),
            local_page_flushes: load(&self.local_page_flushes),
            local_full_flushes: load(&self.local_full_flushes),
            local_global_flushes: load(&self.local_global_flushes),
            remote_handled: load(&self.remote_handled),
            lazy_evictions: load(&self.lazy_evictions),
            dropped_requests: load(&self.dropped_requests),
            overflows: load(&self.overflows),
            #[cfg(feature = "tlbstats")]
            single: load(&self.single),
            #[cfg(feature = "tlbstats")]
            user_all: load(&self.user_all),
            #[cfg(feature = "tlbstats")]
            kernel_all: load(&self.kernel_all),
            #[cfg(feature = "tlbstats")]
            why: core::array::from_fn(|i| load(&self.why[i])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_why_table_matches_discriminants() {
        for (i, why) in TlbWhy::ALL.iter().enumerate() {
            assert_eq!(*why as usize, i);
        }
        assert_eq!(TlbWhy::BusSpace.name(), "bus_space");
    }

    #[test]
    fn test_snapshot_reflects_bumps() {
        let counters = TlbCounters::new();
        bump(&counters.rounds);
        bump(&counters.rounds);
        bump(&counters.lazy_evictions);
        let snap = counters.snapshot();
        assert_eq!(snap.rounds, 2);
        assert_eq!(snap.lazy_evictions, 1);
        assert_eq!(snap.overflows, 0);
    }

    #[cfg(feature = "tlbstats")]
    #[test]
    fn test_request_classes() {
        let counters = TlbCounters::new();
        counters.record_request(TlbWhy::Enter, false, false);
        counters.record_request(TlbWhy::Update, true, false);
        counters.record_request(TlbWhy::KEnter, true, true);
        let snap = counters.snapshot();
        assert_eq!((snap.single, snap.user_all, snap.kernel_all), (1, 1, 1));
        assert_eq!(snap.requests_for(TlbWhy::Enter), 1);
        assert_eq!(snap.requests_for(TlbWhy::BusDma), 0);
    }
}
