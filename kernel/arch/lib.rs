//! x86_64 glue for cross-processor TLB shootdown: LAPIC IPI delivery and the
//! machine-wide coordinator instance.

#![cfg_attr(not(test), no_std)]
#![cfg(target_arch = "x86_64")]

#[macro_use]
extern crate klog;

pub mod apic;
pub mod ipi;
pub mod tlb;

pub use ipi::{get_stats as get_ipi_stats, IpiStats, IPI_VECTOR_TLB_SHOOTDOWN};
pub use tlb::{handle_tlb_shootdown_ipi, init as init_tlb_shootdown, X86Tlb, TLB_SHOOTDOWN};

/// Snapshot of the machine-wide shootdown counters.
pub fn get_tlb_stats() -> mm::TlbShootdownStats {
    TLB_SHOOTDOWN.stats()
}
