//! Per-processor accumulation of pending invalidations.

use cpu_local::CpuSet;
use tlb_ops::LocalFlush;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

/// Single-page slots in a ticket before it degrades to "everything".
pub const TICKET_SLOTS: usize = 6;

/// `count` value meaning every translation must go.
const EVERYTHING: u16 = u16::MAX;

/// Invalidations requested by one processor and not yet carried out.
///
/// Only its owning processor touches a ticket, with the shootdown IPI masked.
/// The mailbox holds a verbatim copy of one ticket while a round is in
/// flight, hence `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTicket {
    vas: [VirtAddr; TICKET_SLOTS],
    count: u16,
    pte: PageTableFlags,
    targets: CpuSet,
    user_space: bool,
}

impl PendingTicket {
    pub const fn new() -> Self {
        Self {
            vas: [VirtAddr::zero(); TICKET_SLOTS],
            count: 0,
            pte: PageTableFlags::empty(),
            targets: CpuSet::EMPTY,
            user_space: false,
        }
    }

    /// No invalidation has been requested since the last reset.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Every translation must be discarded.
    #[inline]
    pub fn is_everything(&self) -> bool {
        self.count == EVERYTHING
    }

    /// Queue one page. Returns `true` if this pushed the ticket into
    /// "everything" mode.
    pub fn add_page(&mut self, va: VirtAddr) -> bool {
        if self.is_everything() {
            return false;
        }
        let n = self.count as usize;
        if n < TICKET_SLOTS {
            self.vas[n] = va;
            self.count += 1;
            false
        } else {
            self.count = EVERYTHING;
            true
        }
    }

    /// Switch to "everything" mode.
    #[inline]
    pub fn add_everything(&mut self) {
        self.count = EVERYTHING;
    }

    /// Accumulate PTE attribute bits.
    #[inline]
    pub fn merge_pte(&mut self, pte: PageTableFlags) {
        self.pte |= pte;
    }

    #[inline]
    pub fn merge_targets(&mut self, cpus: CpuSet) {
        self.targets |= cpus;
    }

    /// Drop targets outside `cpus`.
    #[inline]
    pub fn restrict_targets(&mut self, cpus: CpuSet) {
        self.targets &= cpus;
    }

    #[inline]
    pub fn mark_user_space(&mut self) {
        self.user_space = true;
    }

    #[inline]
    pub fn pte(&self) -> PageTableFlags {
        self.pte
    }

    #[inline]
    pub fn targets(&self) -> CpuSet {
        self.targets
    }

    /// A user address space, not only the kernel's, is involved.
    #[inline]
    pub fn user_space(&self) -> bool {
        self.user_space
    }

    /// Queued pages, empty in "everything" mode.
    pub fn pages(&self) -> &[VirtAddr] {
        if self.is_everything() {
            &[]
        } else {
            &self.vas[..self.count as usize]
        }
    }

    /// Return to the empty state.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed `flush` the local invalidations this ticket calls for.
    ///
    /// A global mapping anywhere in the ticket forces a whole-TLB flush that
    /// includes global entries. Otherwise "everything" mode flushes all
    /// non-global entries, and a page list is flushed page by page, newest
    /// first.
    pub fn for_each_flush(&self, mut flush: impl FnMut(LocalFlush)) {
        if self.pte.contains(PageTableFlags::GLOBAL) {
            flush(LocalFlush::AllIncludingGlobal);
        } else if self.is_everything() {
            flush(LocalFlush::AllNonGlobal);
        } else {
            for &va in self.pages().iter().rev() {
                flush(LocalFlush::Page(va));
            }
        }
    }
}

impl Default for PendingTicket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(ticket: &PendingTicket) -> Vec<LocalFlush> {
        let mut ops = Vec::new();
        ticket.for_each_flush(|op| ops.push(op));
        ops
    }

    #[test]
    fn test_pages_flushed_newest_first() {
        let mut t = PendingTicket::new();
        assert!(t.is_empty());
        t.add_page(VirtAddr::new(0x1000));
        t.add_page(VirtAddr::new(0x2000));
        assert!(!t.is_empty());
        assert_eq!(
            plan(&t),
            vec![
                LocalFlush::Page(VirtAddr::new(0x2000)),
                LocalFlush::Page(VirtAddr::new(0x1000)),
            ]
        );
    }

    #[test]
    fn test_overflow_degrades_to_everything() {
        let mut t = PendingTicket::new();
        for i in 0..TICKET_SLOTS as u64 {
            assert!(!t.add_page(VirtAddr::new((i + 1) << 12)));
        }
        assert!(!t.is_everything());
        assert!(t.add_page(VirtAddr::new(0x40_0000)));
        assert!(t.is_everything());
        assert!(t.pages().is_empty());
        // Already everything: further pages are absorbed silently
        assert!(!t.add_page(VirtAddr::new(0x50_0000)));
        assert_eq!(plan(&t), vec![LocalFlush::AllNonGlobal]);
    }

    #[test]
    fn test_global_bit_upgrades_page_list() {
        let mut t = PendingTicket::new();
        t.add_page(VirtAddr::new(0x1000));
        t.merge_pte(PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        t.add_page(VirtAddr::new(0xFFFF_8000_0000_1000));
        t.merge_pte(PageTableFlags::GLOBAL);
        t.add_page(VirtAddr::new(0x3000));
        t.merge_pte(PageTableFlags::PRESENT);
        assert_eq!(plan(&t), vec![LocalFlush::AllIncludingGlobal]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut t = PendingTicket::new();
        t.add_everything();
        t.merge_pte(PageTableFlags::GLOBAL);
        t.merge_targets(CpuSet::first(4));
        t.mark_user_space();
        t.restrict_targets(CpuSet::first(2));
        assert_eq!(t.targets(), CpuSet::first(2));
        t.reset();
        assert_eq!(t, PendingTicket::new());
        assert!(plan(&t).is_empty());
    }
}
