//! TLB Shootdown Infrastructure
//!
//! Cross-processor TLB invalidation for SMP systems. Page-table code queues
//! invalidations with [`TlbShootdown::shootdown`] and then makes them take
//! effect everywhere with [`TlbShootdown::shootnow`], which returns only once
//! every targeted processor has discarded the stale translations.
//!
//! # Protocol
//!
//! 1. `shootdown()` appends to the calling processor's [`PendingTicket`]:
//!    up to [`TICKET_SLOTS`] pages, then "everything". It also merges the
//!    processors the address space may be resident on into the target set.
//! 2. `shootnow()` claims the single global mailbox with a CAS of the
//!    pending-ack counter from 0 to the number of remote targets, copies the
//!    ticket in, and sends the shootdown IPI (vector 0xFE on x86_64).
//! 3. The requester invalidates locally, resets its ticket, and spins until
//!    the counter drops back to 0 or a later round has been published.
//! 4. Each target's [`TlbShootdown::handle_ipi`] reads the mailbox, flushes,
//!    demotes itself LAZY -> STALE for user spaces, and decrements the counter.
//!
//! At most one round is in flight system-wide. A processor waiting to claim
//! the mailbox drops back to its previous interrupt level so it can service
//! the round that holds it, which keeps overlapping shootdowns deadlock-free.
//!
//! # Memory Ordering
//!
//! - Claim: CAS `Acquire`; publish: generation `Release`
//! - Handler: generation `Acquire`, packet read, ack `Release`
//! - Waiter: pending or generation `Acquire`, so every remote flush
//!   happens-before return. A moved generation was published by a later
//!   owner whose claim already acquired our last ack.
//!
//! # Failure
//!
//! There is no error path. Every invariant violation is fatal: stale TLB
//! entries are never tolerated.

mod backoff;
mod config;
mod mailbox;
mod platform;
mod residency;
mod stats;
mod ticket;

#[cfg(test)]
mod sim;

pub use backoff::{FailFast, SpinBackoff, WaitSite, WaitStrategy};
pub use config::{ConfigError, ShootdownConfig, LARGE_PAGE_SIZE, PAGE_SIZE};
pub use platform::{CpuId, IplCookie, TlbFeatures, TlbPlatform};
pub use residency::{CpuTlb, Residency, Space, TlbState};
pub use stats::{TlbShootdownStats, TlbWhy};
pub use ticket::{PendingTicket, TICKET_SLOTS};

use core::cell::UnsafeCell;
use core::fmt;

use cpu_local::{CpuSet, MAX_CPUS};
use tlb_ops::LocalFlush;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use mailbox::Mailbox;
use stats::{bump, TlbCounters};

/// What a request invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// One page (a large page when the PTE carries the PS bit).
    Page(VirtAddr),
    /// Every translation of the address space.
    All,
}

/// Log and halt on a broken shootdown invariant.
#[cold]
#[inline(never)]
fn fatal(args: fmt::Arguments) -> ! {
    klog_force!("[CRITICAL] {}", args);
    panic!("CRITICAL: {}", args);
}

/// One processor's slot: its pending ticket and residency record.
struct PerCpuTlb {
    ticket: UnsafeCell<PendingTicket>,
    tlb: CpuTlb,
}

// Safety: `ticket` is only touched by its own processor with the shootdown
// IPI masked; `tlb` is atomics only.
unsafe impl Sync for PerCpuTlb {}

impl PerCpuTlb {
    const fn new() -> Self {
        Self {
            ticket: UnsafeCell::new(PendingTicket::new()),
            tlb: CpuTlb::new(),
        }
    }
}

/// Cross-processor TLB shootdown coordinator.
///
/// One instance serves the whole machine; see `arch::tlb` for the x86_64
/// static. All methods must be called with preemption disabled.
pub struct TlbShootdown<P: TlbPlatform, W: WaitStrategy = SpinBackoff> {
    platform: P,
    wait: W,
    config: ShootdownConfig,
    mailbox: Mailbox,
    cpus: [PerCpuTlb; MAX_CPUS],
    stats: TlbCounters,
}

impl<P: TlbPlatform, W: WaitStrategy> TlbShootdown<P, W> {
    pub const fn new(platform: P, wait: W, config: ShootdownConfig) -> Self {
        const INIT: PerCpuTlb = PerCpuTlb::new();
        Self {
            platform,
            wait,
            config,
            mailbox: Mailbox::new(),
            cpus: [INIT; MAX_CPUS],
            stats: TlbCounters::new(),
        }
    }

    /// Check the platform against the CPU mask.
    ///
    /// Boot code calls this once, after the platform can report its CPUs.
    pub fn check(&self) -> Result<(), ConfigError> {
        let ncpu = self.platform.ncpu();
        ShootdownConfig::check_ncpu(ncpu)?;
        if let Some(cpu) = self.platform.running_cpus().iter().find(|&c| c >= ncpu) {
            return Err(ConfigError::CpuOutOfRange { cpu, ncpu });
        }
        Ok(())
    }

    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    pub fn config(&self) -> &ShootdownConfig {
        &self.config
    }

    /// Residency record of `cpu`, for context-switch code.
    ///
    /// # Panics
    ///
    /// Panics if `cpu >= MAX_CPUS`.
    #[inline]
    pub fn cpu(&self, cpu: CpuId) -> &CpuTlb {
        &self.slot(cpu).tlb
    }

    pub fn stats(&self) -> TlbShootdownStats {
        self.stats.snapshot()
    }

    #[inline]
    fn slot(&self, cpu: CpuId) -> &PerCpuTlb {
        match self.cpus.get(cpu) {
            Some(slot) => slot,
            None => fatal(format_args!("CPU {} outside the {} CPU mask", cpu, MAX_CPUS)),
        }
    }

    /// Copy of `cpu`'s pending ticket.
    ///
    /// # Safety
    ///
    /// Must run on `cpu`.
    #[inline]
    unsafe fn read_ticket(&self, cpu: CpuId) -> PendingTicket {
        *self.slot(cpu).ticket.get()
    }

    /// # Safety
    ///
    /// Must run on `cpu` with the shootdown IPI masked, and the reference must
    /// not outlive that.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn ticket_mut(&self, cpu: CpuId) -> &mut PendingTicket {
        &mut *self.slot(cpu).ticket.get()
    }

    fn assert_preemption_disabled(&self, op: &str) {
        if !self.platform.preemption_disabled() {
            fatal(format_args!("tlb {} called with preemption enabled", op));
        }
    }

    /// Queue an invalidation on the calling processor.
    ///
    /// `pte` is the old PTE's flags: `GLOBAL` marks a mapping cached across
    /// address-space switches, `HUGE_PAGE` a 2 MiB mapping. Nothing is
    /// invalidated until [`shootnow`](Self::shootnow).
    ///
    /// Requests against a user space that is being torn down are dropped.
    pub fn shootdown(&self, space: Space<'_>, scope: FlushScope, pte: PageTableFlags, why: TlbWhy) {
        self.assert_preemption_disabled("shootdown");

        let mut pte = pte;
        if !self.platform.features().contains(TlbFeatures::GLOBAL_PAGES) {
            pte.remove(PageTableFlags::GLOBAL);
        }
        if pte.contains(PageTableFlags::GLOBAL) && !space.is_kernel() {
            fatal(format_args!(
                "global PTE bit in a user space shootdown ({:?}, {:?})",
                scope, why
            ));
        }

        if let Space::User(res) = space {
            if res.is_tearing_down() {
                bump(&self.stats.dropped_requests);
                klog!(Trace, "tlb: dropped {:?} on dying space ({:?})", scope, why);
                return;
            }
        }

        let va = match scope {
            FlushScope::Page(va) if pte.contains(PageTableFlags::HUGE_PAGE) => {
                Some(va.align_down(LARGE_PAGE_SIZE))
            }
            FlushScope::Page(va) => Some(va),
            FlushScope::All => None,
        };

        let cookie = self.platform.raise_ipl();
        let cpu = self.platform.current_cpu();
        // Safety: on `cpu` with the IPI masked until restore_ipl below
        let ticket = unsafe { self.ticket_mut(cpu) };

        ticket.merge_pte(pte);
        match va {
            Some(va) => {
                if ticket.add_page(va) {
                    bump(&self.stats.overflows);
                }
            }
            None => ticket.add_everything(),
        }

        match space {
            Space::Kernel => ticket.merge_targets(self.platform.running_cpus()),
            Space::User(res) => {
                let mut cpus = res.cpus();
                if va.map_or(true, |va| self.config.is_kernel_va(va)) {
                    cpus |= res.kernel_cpus();
                }
                ticket.merge_targets(cpus);
                ticket.mark_user_space();
            }
        }

        self.stats.record_request(why, va.is_none(), space.is_kernel());
        self.platform.restore_ipl(cookie);
    }

    /// Carry out every invalidation queued on the calling processor and wait
    /// until all targeted processors have done the same.
    ///
    /// Returns immediately if nothing is queued.
    pub fn shootnow(&self) {
        self.assert_preemption_disabled("shootnow");

        let cpu = self.platform.current_cpu();
        // Safety: running on `cpu`
        if unsafe { self.read_ticket(cpu) }.is_empty() {
            return;
        }

        let mut cookie = self.platform.raise_ipl();
        let mut contended = false;
        let mut attempt = 0u32;

        let (ticket, remote) = loop {
            // Safety: on `cpu` with the IPI masked
            let mut ticket = unsafe { self.read_ticket(cpu) };
            if ticket.is_empty() {
                // Drained by an interrupt-level flush while we backed off
                if contended {
                    bump(&self.stats.acquire_abandoned);
                    klog!(Debug, "tlb: cpu {} ticket drained while waiting for mailbox", cpu);
                }
                self.platform.restore_ipl(cookie);
                return;
            }

            ticket.restrict_targets(self.platform.running_cpus() | CpuSet::single(cpu));
            let remote = ticket.targets().without(cpu);
            let count = remote.count();
            if count >= self.platform.ncpu() {
                fatal(format_args!(
                    "{} remote shootdown targets with {} CPUs",
                    count,
                    self.platform.ncpu()
                ));
            }
            if count == 0 || self.mailbox.try_claim(count as u32) {
                break (ticket, remote);
            }

            // Busy: let the owner's IPI in while we wait, then retry.
            contended = true;
            bump(&self.stats.acquire_contended);
            self.platform.restore_ipl(cookie);
            while self.mailbox.pending() != 0 {
                self.wait
                    .pause(WaitSite::Acquire, attempt, &|| self.platform.cpu_relax());
                attempt = attempt.saturating_add(1);
            }
            cookie = self.platform.raise_ipl();
        };

        let round = if remote.is_empty() {
            None
        } else {
            bump(&self.stats.rounds);
            // Safety: the claim above succeeded and no IPI is out yet
            let gen = unsafe { self.mailbox.publish(&ticket) };
            self.dispatch(cpu, remote);
            Some(gen)
        };

        if ticket.targets().contains(cpu) {
            ticket.for_each_flush(|op| self.flush_local(op));
        }

        // Safety: on `cpu` with the IPI still masked
        unsafe { self.ticket_mut(cpu).reset() };

        if let Some(gen) = round {
            self.await_round(gen);
        }

        self.platform.restore_ipl(cookie);
    }

    /// Shootdown IPI handler. Runs on each remote target of a round.
    pub fn handle_ipi(&self) {
        let cpu = self.platform.current_cpu();
        if self.mailbox.pending() == 0 {
            fatal(format_args!("shootdown IPI on cpu {} with no round in flight", cpu));
        }

        // Safety: a round is in flight and we have not acked it
        let (gen, packet) = unsafe { self.mailbox.read() };
        if !packet.targets().contains(cpu) {
            klog!(Trace, "tlb: cpu {} not a target of gen {}, ignoring IPI", cpu, gen);
            return;
        }

        packet.for_each_flush(|op| self.flush_local(op));

        if packet.user_space() && self.slot(cpu).tlb.evict_lazy(cpu) {
            bump(&self.stats.lazy_evictions);
        }

        bump(&self.stats.remote_handled);
        klog!(Trace, "tlb: cpu {} acked gen {}", cpu, gen);
        self.mailbox.ack();
    }

    /// Post the IPI to every remote target, as one broadcast when the
    /// targets are exactly the other running processors.
    fn dispatch(&self, cpu: CpuId, remote: CpuSet) {
        let others = self.platform.running_cpus().without(cpu);
        if self.platform.features().contains(TlbFeatures::BROADCAST_IPI) && remote == others {
            bump(&self.stats.ipis_broadcast);
            self.platform.broadcast_shootdown_ipi();
        } else {
            for target in remote {
                bump(&self.stats.ipis_unicast);
                self.platform.send_shootdown_ipi(target);
            }
        }
    }

    /// Spin until every target of round `gen` has acknowledged.
    ///
    /// The mailbox may be claimed again, possibly targeting us, before we
    /// observe `pending == 0`. A newer generation proves our round drained:
    /// the next owner's claim acquired the last ack and its publish released
    /// it to us.
    fn await_round(&self, gen: u32) {
        let mut attempt = 0u32;
        loop {
            let seen = self.mailbox.generation();
            if seen != gen {
                if seen.wrapping_sub(gen) > u32::MAX / 2 {
                    fatal(format_args!(
                        "mailbox generation went back from {} to {}",
                        gen, seen
                    ));
                }
                return;
            }
            if self.mailbox.pending() == 0 {
                return;
            }
            self.wait
                .pause(WaitSite::Await, attempt, &|| self.platform.cpu_relax());
            attempt = attempt.saturating_add(1);
        }
    }

    fn flush_local(&self, op: LocalFlush) {
        match op {
            LocalFlush::Page(_) => bump(&self.stats.local_page_flushes),
            LocalFlush::AllNonGlobal => bump(&self.stats.local_full_flushes),
            LocalFlush::AllIncludingGlobal => bump(&self.stats.local_global_flushes),
        }
        self.platform.invalidate(op);
    }

    /// Copy of `cpu`'s ticket, for tests.
    #[cfg(test)]
    pub(crate) fn pending_ticket(&self, cpu: CpuId) -> PendingTicket {
        unsafe { self.read_ticket(cpu) }
    }
}
