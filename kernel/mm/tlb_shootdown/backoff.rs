//! Busy-wait policies for the two places a shootdown spins.

use core::fmt;

/// Where the coordinator is spinning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSite {
    /// Waiting for another processor's round to release the mailbox.
    Acquire,
    /// Waiting for remote processors to acknowledge our own round.
    Await,
}

impl fmt::Display for WaitSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitSite::Acquire => f.write_str("mailbox acquire"),
            WaitSite::Await => f.write_str("ack await"),
        }
    }
}

/// How to pass time between two polls of the mailbox.
///
/// `attempt` counts polls since the wait began, starting at 0. `relax` is
/// the platform's per-step relax hook and should be called at least once.
pub trait WaitStrategy: Sync {
    fn pause(&self, site: WaitSite, attempt: u32, relax: &dyn Fn());
}

/// Exponential spin backoff: `min << attempt` relax steps, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct SpinBackoff {
    min: u32,
    max: u32,
}

impl SpinBackoff {
    /// Default lower bound on relax steps per poll.
    pub const MIN: u32 = 4;
    /// Default upper bound on relax steps per poll.
    pub const MAX: u32 = 128;

    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Relax steps taken for poll number `attempt`.
    #[inline]
    pub fn spins(&self, attempt: u32) -> u32 {
        let grown = (self.min.max(1) as u64) << attempt.min(32);
        grown.min(self.max.max(1) as u64) as u32
    }
}

impl Default for SpinBackoff {
    fn default() -> Self {
        Self::new(Self::MIN, Self::MAX)
    }
}

impl WaitStrategy for SpinBackoff {
    #[inline]
    fn pause(&self, _site: WaitSite, attempt: u32, relax: &dyn Fn()) {
        for _ in 0..self.spins(attempt) {
            relax();
        }
    }
}

/// Test double: relax once per poll and panic after `limit` polls.
///
/// Turns a wait that should never happen, or never end, into an immediate
/// failure instead of a hung test.
#[derive(Debug, Clone, Copy)]
pub struct FailFast {
    limit: u32,
}

impl FailFast {
    pub const fn new(limit: u32) -> Self {
        Self { limit }
    }
}

impl WaitStrategy for FailFast {
    fn pause(&self, site: WaitSite, attempt: u32, relax: &dyn Fn()) {
        if attempt >= self.limit {
            panic!("tlb shootdown: {} still spinning after {} polls", site, attempt);
        }
        relax();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn test_spin_backoff_doubles_then_caps() {
        let b = SpinBackoff::default();
        let steps: Vec<u32> = (0..8).map(|a| b.spins(a)).collect();
        assert_eq!(steps, vec![4, 8, 16, 32, 64, 128, 128, 128]);
        assert_eq!(b.spins(u32::MAX), 128);
    }

    #[test]
    fn test_spin_backoff_calls_relax() {
        let calls = Cell::new(0u32);
        SpinBackoff::new(2, 16).pause(WaitSite::Await, 2, &|| calls.set(calls.get() + 1));
        assert_eq!(calls.get(), 8);
    }

    #[test]
    #[should_panic(expected = "ack await still spinning after 3 polls")]
    fn test_fail_fast_panics_at_limit() {
        let ff = FailFast::new(3);
        for attempt in 0..=3 {
            ff.pause(WaitSite::Await, attempt, &|| {});
        }
    }
}
