//! Processor sets.
//!
//! A [`CpuSet`] is a plain 64-bit mask (bit N = CPU N), the same representation
//! the scheduler cpusets and the online mask use. [`AtomicCpuSet`] is the
//! shared variant embedded in structures that several CPUs update, such as an
//! address space's resident set.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_CPUS;

/// Convert CPU ID to bitmask bit.
///
/// # Panics
///
/// Panics if `cpu_id` cannot be represented in the mask.
#[inline]
fn cpu_bit(cpu_id: usize) -> u64 {
    assert!(cpu_id < MAX_CPUS, "CPU ID {} out of range (max {})", cpu_id, MAX_CPUS);
    1u64 << cpu_id
}

/// A set of logical CPU indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set.
    pub const EMPTY: CpuSet = CpuSet(0);

    /// Build a set from a raw mask.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        CpuSet(bits)
    }

    /// Raw mask.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The set containing only `cpu_id`.
    #[inline]
    pub fn single(cpu_id: usize) -> Self {
        CpuSet(cpu_bit(cpu_id))
    }

    /// CPUs `0..n`.
    #[inline]
    pub fn first(n: usize) -> Self {
        assert!(n <= MAX_CPUS, "{} CPUs exceed the {} CPU mask", n, MAX_CPUS);
        if n == MAX_CPUS {
            CpuSet(u64::MAX)
        } else {
            CpuSet((1u64 << n) - 1)
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the set.
    #[inline]
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn contains(self, cpu_id: usize) -> bool {
        cpu_id < MAX_CPUS && self.0 & (1u64 << cpu_id) != 0
    }

    #[inline]
    pub fn insert(&mut self, cpu_id: usize) {
        self.0 |= cpu_bit(cpu_id);
    }

    #[inline]
    pub fn remove(&mut self, cpu_id: usize) {
        self.0 &= !cpu_bit(cpu_id);
    }

    /// Copy of this set without `cpu_id`.
    #[inline]
    #[must_use]
    pub fn without(mut self, cpu_id: usize) -> Self {
        self.remove(cpu_id);
        self
    }

    /// Iterate CPU indices in ascending order.
    #[inline]
    pub fn iter(self) -> CpuSetIter {
        CpuSetIter(self.0)
    }
}

impl BitOr for CpuSet {
    type Output = CpuSet;

    #[inline]
    fn bitor(self, rhs: CpuSet) -> CpuSet {
        CpuSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for CpuSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: CpuSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CpuSet {
    type Output = CpuSet;

    #[inline]
    fn bitand(self, rhs: CpuSet) -> CpuSet {
        CpuSet(self.0 & rhs.0)
    }
}

impl BitAndAssign for CpuSet {
    #[inline]
    fn bitand_assign(&mut self, rhs: CpuSet) {
        self.0 &= rhs.0;
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::EMPTY;
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl IntoIterator for CpuSet {
    type Item = usize;
    type IntoIter = CpuSetIter;

    #[inline]
    fn into_iter(self) -> CpuSetIter {
        self.iter()
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over the members of a [`CpuSet`].
#[derive(Clone)]
pub struct CpuSetIter(u64);

impl Iterator for CpuSetIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(cpu)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

/// A [`CpuSet`] that several CPUs update concurrently.
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    pub const fn new(set: CpuSet) -> Self {
        AtomicCpuSet(AtomicU64::new(set.0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> CpuSet {
        CpuSet(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, set: CpuSet, order: Ordering) {
        self.0.store(set.0, order);
    }

    /// Add `cpu_id`; returns whether it was already present.
    #[inline]
    pub fn insert(&self, cpu_id: usize, order: Ordering) -> bool {
        let bit = cpu_bit(cpu_id);
        self.0.fetch_or(bit, order) & bit != 0
    }

    /// Remove `cpu_id`; returns whether it was present.
    #[inline]
    pub fn remove(&self, cpu_id: usize, order: Ordering) -> bool {
        let bit = cpu_bit(cpu_id);
        self.0.fetch_and(!bit, order) & bit != 0
    }

    #[inline]
    pub fn contains(&self, cpu_id: usize, order: Ordering) -> bool {
        self.load(order).contains(cpu_id)
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
