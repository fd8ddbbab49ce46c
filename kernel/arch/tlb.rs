//! x86_64 platform for the TLB shootdown coordinator.
//!
//! The interrupt level is RFLAGS.IF: raising it masks the shootdown vector
//! along with everything else. The running set is the `cpu_local` online
//! mask, and local flushes go straight to `tlb_ops`.

use cpu_local::{current_cpu, current_cpu_id, lapic_id_for_cpu, max_cpus, online_cpus, CpuSet};
use mm::tlb_shootdown::{IplCookie, SpinBackoff};
use mm::{ConfigError, CpuId, ShootdownConfig, TlbFeatures, TlbPlatform, TlbShootdown};
use tlb_ops::LocalFlush;
use x86_64::instructions::interrupts;

use crate::{apic, ipi};

/// Hardware-backed [`TlbPlatform`].
pub struct X86Tlb;

/// Number of CPUs with a registered LAPIC, online or still coming up.
fn registered_cpus() -> usize {
    (0..max_cpus())
        .filter(|&cpu| lapic_id_for_cpu(cpu).is_some())
        .count()
}

impl TlbPlatform for X86Tlb {
    #[inline]
    fn current_cpu(&self) -> CpuId {
        current_cpu_id()
    }

    #[inline]
    fn running_cpus(&self) -> CpuSet {
        online_cpus()
    }

    fn ncpu(&self) -> usize {
        registered_cpus().max(1)
    }

    /// PGE is read from CR4 on each call; the BSP may enable it after the
    /// coordinator is set up. Broadcast is only offered once every registered
    /// CPU is online, so the shorthand never reaches a CPU outside the round.
    fn features(&self) -> TlbFeatures {
        let mut features = TlbFeatures::empty();
        if tlb_ops::global_pages_enabled() {
            features |= TlbFeatures::GLOBAL_PAGES;
        }
        if online_cpus().count() == registered_cpus() {
            features |= TlbFeatures::BROADCAST_IPI;
        }
        features
    }

    fn preemption_disabled(&self) -> bool {
        !interrupts::are_enabled() || !current_cpu().preemptible()
    }

    #[inline]
    fn raise_ipl(&self) -> IplCookie {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        IplCookie(was_enabled as u64)
    }

    #[inline]
    fn restore_ipl(&self, cookie: IplCookie) {
        if cookie.0 != 0 {
            interrupts::enable();
        }
    }

    #[inline]
    fn send_shootdown_ipi(&self, cpu: CpuId) {
        ipi::send_tlb_shootdown(cpu);
    }

    #[inline]
    fn broadcast_shootdown_ipi(&self) {
        ipi::broadcast_tlb_shootdown();
    }

    #[inline]
    fn invalidate(&self, op: LocalFlush) {
        // Safety: kernel code at CPL 0 with interrupts masked
        unsafe { tlb_ops::flush_local(op) };
    }
}

/// The machine-wide shootdown coordinator.
pub static TLB_SHOOTDOWN: TlbShootdown<X86Tlb> =
    TlbShootdown::new(
        X86Tlb,
        SpinBackoff::new(SpinBackoff::MIN, SpinBackoff::MAX),
        ShootdownConfig::X86_64,
    );

/// Validate the coordinator against the CPUs brought up so far.
///
/// Called by the BSP after SMP bring-up and before the first user space is
/// created.
pub fn init() -> Result<(), ConfigError> {
    TLB_SHOOTDOWN.check()?;
    let features = TLB_SHOOTDOWN.platform().features();
    klog_always!(
        "TLB shootdown: {} CPUs, vector {:#x}, PGE {}, INVPCID {}",
        TLB_SHOOTDOWN.platform().ncpu(),
        ipi::IPI_VECTOR_TLB_SHOOTDOWN,
        features.contains(TlbFeatures::GLOBAL_PAGES),
        tlb_ops::invpcid_supported()
    );
    Ok(())
}

/// Body of the vector 0xFE interrupt handler.
pub fn handle_tlb_shootdown_ipi() {
    let cpu = current_cpu();
    cpu.irq_enter();
    cpu.tlb_ipis.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    TLB_SHOOTDOWN.handle_ipi();

    // Safety: in the IPI handler, after the mailbox was acknowledged
    unsafe { apic::lapic_eoi() };
    cpu.irq_exit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_coordinator_config() {
        assert_eq!(*TLB_SHOOTDOWN.config(), ShootdownConfig::X86_64);
        assert!(TLB_SHOOTDOWN
            .config()
            .is_kernel_va(x86_64::VirtAddr::new(0xFFFF_8000_0000_1000)));
    }
}
