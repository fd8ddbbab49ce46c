//! Shootdown IPI delivery.
//!
//! | Vector | Purpose |
//! |--------|---------|
//! | 0xFE | TLB_SHOOTDOWN: cross-CPU TLB invalidation |
//!
//! Unicast IPIs go to one logical CPU through its registered LAPIC ID;
//! the broadcast uses the all-excluding-self shorthand.

use core::sync::atomic::{AtomicU64, Ordering};

use cpu_local::lapic_id_for_cpu;

use crate::apic;

/// IPI vector for TLB shootdown
///
/// Sent when page table entries are modified and other CPUs may have
/// stale TLB entries. The target CPU should flush the affected TLB entries.
pub const IPI_VECTOR_TLB_SHOOTDOWN: u8 = 0xFE;

/// Statistics for shootdown IPI delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpiStats {
    /// Unicast shootdown IPIs written to the ICR
    pub unicast_sent: u64,
    /// All-excluding-self broadcasts
    pub broadcast_sent: u64,
}

static STATS_UNICAST: AtomicU64 = AtomicU64::new(0);
static STATS_BROADCAST: AtomicU64 = AtomicU64::new(0);

/// Get current IPI statistics
pub fn get_stats() -> IpiStats {
    IpiStats {
        unicast_sent: STATS_UNICAST.load(Ordering::Relaxed),
        broadcast_sent: STATS_BROADCAST.load(Ordering::Relaxed),
    }
}

/// Send the shootdown IPI to `target_cpu`.
///
/// # Panics
///
/// If `target_cpu` has no registered LAPIC ID. The caller has already
/// counted it in the round, so the round could never drain.
#[inline]
pub fn send_tlb_shootdown(target_cpu: usize) {
    match lapic_id_for_cpu(target_cpu) {
        Some(dest_lapic) => {
            // Safety: LAPIC is mapped and 0xFE is a fixed-mode vector
            unsafe {
                apic::send_ipi_raw(
                    dest_lapic,
                    IPI_VECTOR_TLB_SHOOTDOWN,
                    apic::icr_delivery::FIXED,
                );
            }
            STATS_UNICAST.fetch_add(1, Ordering::Relaxed);
        }
        None => {
            klog_force!(
                "[CRITICAL] ipi: cpu {} has no LAPIC id, shootdown IPI cannot be sent",
                target_cpu
            );
            panic!("tlb shootdown: IPI to cpu {} failed: no LAPIC id", target_cpu);
        }
    }
}

/// Send the shootdown IPI to every other CPU.
#[inline]
pub fn broadcast_tlb_shootdown() {
    // Safety: LAPIC is mapped
    unsafe { apic::broadcast_ipi_all_except_self(IPI_VECTOR_TLB_SHOOTDOWN) };
    STATS_BROADCAST.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "no LAPIC id")]
    fn test_unicast_to_unregistered_cpu_is_fatal() {
        let cpu = cpu_local::MAX_CPUS - 1;
        assert_eq!(lapic_id_for_cpu(cpu), None);
        send_tlb_shootdown(cpu);
    }
}
