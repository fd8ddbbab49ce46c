//! The single shared shootdown mailbox.
//!
//! # Protocol
//!
//! `pending` is both the claim token and the completion counter:
//!
//! 1. Owner: CAS `pending` 0 -> remote count (`Acquire`)
//! 2. Owner: copy its ticket into `packet`, bump `generation` (`Release`)
//! 3. Owner: send the IPIs
//! 4. Target: load `generation` (`Acquire`), read `packet`, flush,
//!    decrement `pending` (`Release`)
//! 5. Owner: spin until `pending` reads 0 (`Acquire`)
//!
//! The last target's decrement both completes the round and frees the
//! mailbox. The `Acquire` on the next claim orders the next owner's packet
//! write after every read of the previous packet.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use super::ticket::PendingTicket;

pub(crate) struct Mailbox {
    /// Remote processors that have not yet acknowledged the current round.
    pending: AtomicU32,
    /// Incremented once per published round.
    generation: AtomicU32,
    /// Copy of the owner's ticket, valid while `pending != 0`.
    packet: UnsafeCell<PendingTicket>,
}

// Safety: `packet` is written only by the processor that won the claim CAS and
// read only by targets of that round between publish and their ack.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub(crate) const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            packet: UnsafeCell::new(PendingTicket::new()),
        }
    }

    /// Claim the mailbox for a round with `remote` acknowledgements.
    #[inline]
    pub(crate) fn try_claim(&self, remote: u32) -> bool {
        debug_assert!(remote != 0);
        self.pending
            .compare_exchange(0, remote, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Copy `ticket` into the packet and open a new generation.
    ///
    /// # Safety
    ///
    /// The caller must hold the claim from [`try_claim`](Self::try_claim) and
    /// not have sent any IPI for it yet.
    #[inline]
    pub(crate) unsafe fn publish(&self, ticket: &PendingTicket) -> u32 {
        *self.packet.get() = *ticket;
        self.generation.fetch_add(1, Ordering::Release).wrapping_add(1)
    }

    /// Snapshot the packet of the round in flight.
    ///
    /// # Safety
    ///
    /// Only a target of the current round may call this, before its
    /// [`ack`](Self::ack).
    #[inline]
    pub(crate) unsafe fn read(&self) -> (u32, PendingTicket) {
        let gen = self.generation.load(Ordering::Acquire);
        (gen, *self.packet.get())
    }

    /// Acknowledge the current round. Returns the count still outstanding.
    #[inline]
    pub(crate) fn ack(&self) -> u32 {
        let old = self.pending.fetch_sub(1, Ordering::Release);
        assert!(old != 0, "tlb mailbox acknowledged with no round in flight");
        old - 1
    }

    #[inline]
    pub(crate) fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpu_local::CpuSet;
    use x86_64::VirtAddr;

    #[test]
    fn test_claim_is_exclusive_until_drained() {
        let mb = Mailbox::new();
        assert!(mb.try_claim(2));
        assert!(!mb.try_claim(1));
        assert_eq!(mb.ack(), 1);
        assert!(!mb.try_claim(1));
        assert_eq!(mb.ack(), 0);
        assert!(mb.try_claim(1));
    }

    #[test]
    fn test_publish_snapshots_ticket() {
        let mb = Mailbox::new();
        let mut t = PendingTicket::new();
        t.add_page(VirtAddr::new(0x7000));
        t.merge_targets(CpuSet::single(3));
        assert!(mb.try_claim(1));
        let gen = unsafe { mb.publish(&t) };
        assert_eq!(gen, 1);
        t.reset();

        let (seen, packet) = unsafe { mb.read() };
        assert_eq!(seen, gen);
        assert_eq!(packet.pages(), &[VirtAddr::new(0x7000)]);
        assert!(packet.targets().contains(3));
        mb.ack();
        assert_eq!(mb.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "no round in flight")]
    fn test_ack_without_round() {
        Mailbox::new().ack();
    }
}
