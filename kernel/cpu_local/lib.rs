//! Minimal per-CPU storage for SMP support
//!
//! Provides CPU-ID indexed storage, the LAPIC ID <-> logical index maps used
//! to answer "which CPU am I", the set of CPUs that have finished bring-up
//! (the *running set*), and the [`CpuSet`] mask type shared by every
//! cross-processor subsystem.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cpu_local::CpuLocal;
//! use core::sync::atomic::AtomicUsize;
//!
//! static MY_DATA: CpuLocal<AtomicUsize> = CpuLocal::new(|| AtomicUsize::new(0));
//!
//! MY_DATA.with(|d| d.fetch_add(1, Ordering::SeqCst));
//! ```

#![cfg_attr(not(test), no_std)]

mod cpuset;

pub use cpuset::{AtomicCpuSet, CpuSet, CpuSetIter};

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Once;

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 64;

/// Invalid LAPIC ID marker
const INVALID_LAPIC_ID: u32 = u32::MAX;

/// Invalid CPU ID marker for reverse mapping
const INVALID_CPU_ID: usize = usize::MAX;

/// Size of LAPIC ID reverse mapping table (covers all 8-bit LAPIC IDs)
const LAPIC_ID_REVERSE_MAP_SIZE: usize = 256;

/// Index = CPU logical index, Value = hardware LAPIC ID.
static LAPIC_ID_MAP: [AtomicU32; MAX_CPUS] = {
    const INIT: AtomicU32 = AtomicU32::new(INVALID_LAPIC_ID);
    [INIT; MAX_CPUS]
};

/// Index = hardware LAPIC ID (0..255), Value = CPU logical index.
///
/// Gives O(1) LAPIC ID to CPU index lookup from interrupt entry.
static LAPIC_ID_REVERSE_MAP: [AtomicUsize; LAPIC_ID_REVERSE_MAP_SIZE] = {
    const INIT: AtomicUsize = AtomicUsize::new(INVALID_CPU_ID);
    [INIT; LAPIC_ID_REVERSE_MAP_SIZE]
};

/// Bit N is set once CPU N has fully initialized and can take IPIs.
///
/// BSP (bit 0) is online from the start. APs set their bit via
/// [`register_cpu_online`] at the end of bring-up, after which they may be
/// chosen as shootdown targets.
static ONLINE_CPU_MASK: AtomicCpuSet = AtomicCpuSet::new(CpuSet::from_bits(1));

// ============================================================================
// Per-CPU Data Structure
// ============================================================================

/// Per-CPU identity and context counters.
///
/// All fields are atomics so interrupt handlers and remote CPUs may read them.
#[repr(C)]
pub struct PerCpuData {
    /// Logical CPU index (0-based)
    pub cpu_id: AtomicUsize,
    /// Local APIC ID read from hardware
    pub lapic_id: AtomicU32,
    /// Preemption disable nesting counter (non-zero = preemption disabled)
    pub preempt_count: AtomicU32,
    /// Interrupt handler nesting counter
    pub irq_count: AtomicU32,
    /// Shootdown IPIs serviced on this CPU
    pub tlb_ipis: AtomicU64,
}

impl PerCpuData {
    /// Construct a zeroed per-CPU record.
    pub const fn new() -> Self {
        Self {
            cpu_id: AtomicUsize::new(0),
            lapic_id: AtomicU32::new(0),
            preempt_count: AtomicU32::new(0),
            irq_count: AtomicU32::new(0),
            tlb_ipis: AtomicU64::new(0),
        }
    }

    /// Initialize this CPU slot with its identity.
    pub fn init(&self, cpu_id: usize, lapic_id: u32) {
        self.cpu_id.store(cpu_id, Ordering::Relaxed);
        self.lapic_id.store(lapic_id, Ordering::Relaxed);
        self.preempt_count.store(0, Ordering::Relaxed);
        self.irq_count.store(0, Ordering::Relaxed);
        self.tlb_ipis.store(0, Ordering::Relaxed);
    }

    /// Disable preemption on this CPU.
    ///
    /// Returns the new preemption count. Preemption is disabled when count > 0.
    #[inline]
    pub fn preempt_disable(&self) -> u32 {
        self.preempt_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enable preemption on this CPU.
    ///
    /// Returns the new preemption count. Panics if count would go negative.
    #[inline]
    pub fn preempt_enable(&self) -> u32 {
        let old = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "preempt_enable called with count already 0");
        old - 1
    }

    /// Check if preemption is enabled on this CPU.
    #[inline]
    pub fn preemptible(&self) -> bool {
        self.preempt_count.load(Ordering::Relaxed) == 0
            && self.irq_count.load(Ordering::Relaxed) == 0
    }

    /// Enter an IRQ handler context.
    #[inline]
    pub fn irq_enter(&self) {
        self.irq_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Exit an IRQ handler context.
    #[inline]
    pub fn irq_exit(&self) {
        let old = self.irq_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "irq_exit called with count already 0");
    }

    /// Check if we're currently in an IRQ handler.
    #[inline]
    pub fn in_irq(&self) -> bool {
        self.irq_count.load(Ordering::Relaxed) > 0
    }
}

impl Default for PerCpuData {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU storage wrapper
///
/// Stores one instance of T per CPU, lazily initialized on first access.
/// Safe to use from interrupt context as long as T's operations are safe.
pub struct CpuLocal<T> {
    /// Initialization function for each CPU's slot
    init: fn() -> T,
    /// Array of per-CPU slots, initialized lazily
    slots: Once<UnsafeCell<[MaybeUninit<T>; MAX_CPUS]>>,
}

// Safety: each CPU only accesses its own slot; cross-CPU access requires T: Sync
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send + Sync> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    /// Create a new per-CPU storage with the given initializer
    ///
    /// The initializer is called once per CPU slot on first access.
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            slots: Once::new(),
        }
    }

    fn get_slots(&self) -> &UnsafeCell<[MaybeUninit<T>; MAX_CPUS]> {
        self.slots.call_once(|| {
            let mut arr: [MaybeUninit<T>; MAX_CPUS] = [const { MaybeUninit::uninit() }; MAX_CPUS];
            for slot in &mut arr {
                slot.write((self.init)());
            }
            UnsafeCell::new(arr)
        })
    }

    /// Access the current CPU's slot.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let id = current_cpu_id();
        assert!(
            id < MAX_CPUS,
            "CPU ID {} out of range (max {})",
            id,
            MAX_CPUS
        );
        // Safety: every slot was written in get_slots(); id is bounds checked
        let slot = unsafe { (*self.get_slots().get())[id].assume_init_ref() };
        f(slot)
    }

    /// Get a reference to a specific CPU's slot.
    ///
    /// Only meaningful when `T` supports concurrent access (atomics); the
    /// owning CPU may be mutating it at the same time.
    ///
    /// Returns `None` if `cpu_id >= MAX_CPUS`.
    #[inline]
    pub fn get_cpu(&self, cpu_id: usize) -> Option<&T> {
        if cpu_id >= MAX_CPUS {
            return None;
        }
        // Safety: every slot was written in get_slots(); cpu_id is bounds checked
        Some(unsafe { (*self.get_slots().get())[cpu_id].assume_init_ref() })
    }
}

/// Get the current CPU ID
///
/// Reads the LAPIC ID from hardware (0xFEE00020, bits 31:24) and maps it to
/// the logical index with one lookup in the reverse map. Falls back to CPU 0
/// during early boot, before the BSP registers itself.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn current_cpu_id() -> usize {
    // Safety: the LAPIC register page is identity mapped by early boot
    let apic_id = unsafe {
        let apic_base = 0xFEE0_0020 as *const u32;
        (core::ptr::read_volatile(apic_base) >> 24) as usize
    };
    cpu_for_lapic_id(apic_id).unwrap_or(0)
}

/// Hosted builds have no LAPIC; everything runs as CPU 0.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline]
pub fn current_cpu_id() -> usize {
    0
}

/// Logical index registered for `lapic_id`, if any.
#[inline]
pub fn cpu_for_lapic_id(lapic_id: usize) -> Option<usize> {
    if lapic_id >= LAPIC_ID_REVERSE_MAP_SIZE {
        return None;
    }
    let cpu = LAPIC_ID_REVERSE_MAP[lapic_id].load(Ordering::Relaxed);
    (cpu < MAX_CPUS).then_some(cpu)
}

/// Register the LAPIC ID to CPU index mapping.
///
/// Must be called for each CPU during bring-up so `current_cpu_id()` works.
///
/// # Panics
///
/// Panics if `cpu_id` is out of range.
pub fn register_cpu_id(cpu_id: usize, lapic_id: u32) {
    assert!(cpu_id < MAX_CPUS, "CPU ID {} out of range", cpu_id);
    LAPIC_ID_MAP[cpu_id].store(lapic_id, Ordering::Relaxed);

    if (lapic_id as usize) < LAPIC_ID_REVERSE_MAP_SIZE {
        LAPIC_ID_REVERSE_MAP[lapic_id as usize].store(cpu_id, Ordering::Relaxed);
    }
}

/// Get the maximum number of supported CPUs
pub const fn max_cpus() -> usize {
    MAX_CPUS
}

/// Get the LAPIC ID for a CPU index if it has been registered.
///
/// Used by IPI sending code to map logical CPU index to hardware LAPIC ID.
#[inline]
pub fn lapic_id_for_cpu(cpu_id: usize) -> Option<u32> {
    if cpu_id >= MAX_CPUS {
        return None;
    }
    let id = LAPIC_ID_MAP[cpu_id].load(Ordering::Relaxed);
    if id == INVALID_LAPIC_ID {
        None
    } else {
        Some(id)
    }
}

// ============================================================================
// Running Set
// ============================================================================

/// Mark `cpu_id` online.
///
/// Called by each AP as the last step of bring-up. Release pairs with the
/// Acquire in [`online_cpus`] so a CPU that observes the bit also observes
/// the AP's per-CPU initialization.
pub fn register_cpu_online(cpu_id: usize) {
    if cpu_id >= MAX_CPUS {
        return;
    }
    ONLINE_CPU_MASK.insert(cpu_id, Ordering::Release);
}

/// The set of CPUs that have finished bring-up.
#[inline]
pub fn online_cpus() -> CpuSet {
    ONLINE_CPU_MASK.load(Ordering::Acquire)
}

/// Check if a specific CPU is marked as online.
#[inline]
pub fn is_cpu_online(cpu_id: usize) -> bool {
    online_cpus().contains(cpu_id)
}

/// Number of online CPUs.
#[inline]
pub fn online_cpu_count() -> usize {
    online_cpus().count()
}

// ============================================================================
// Global Per-CPU Data Access
// ============================================================================

/// Global per-CPU data block.
///
/// Access it via `current_cpu()` or `PER_CPU_DATA.get_cpu()`.
pub static PER_CPU_DATA: CpuLocal<PerCpuData> = CpuLocal::new(PerCpuData::new);

/// Access the current CPU's `PerCpuData`.
#[inline]
pub fn current_cpu() -> &'static PerCpuData {
    let id = current_cpu_id();
    match PER_CPU_DATA.get_cpu(id) {
        Some(data) => data,
        None => panic!("CPU ID {} out of range (max {})", id, MAX_CPUS),
    }
}

/// Initialize the bootstrap processor's per-CPU slot.
///
/// Must be invoked during early boot before interrupts are enabled.
pub fn init_bsp(lapic_id: u32) {
    register_cpu_id(0, lapic_id);
    current_cpu().init(0, lapic_id);
}

/// Initialize an application processor's per-CPU slot.
///
/// Called by AP bootstrap code after the AP has started executing. The AP is
/// not a shootdown target until it also calls [`register_cpu_online`].
///
/// # Panics
///
/// Panics if cpu_id is 0 (BSP) or out of range.
pub fn init_ap(cpu_id: usize, lapic_id: u32) {
    assert!(cpu_id > 0, "init_ap must not be called for BSP (CPU 0)");
    assert!(cpu_id < MAX_CPUS, "CPU ID {} out of range", cpu_id);

    register_cpu_id(cpu_id, lapic_id);
    if let Some(data) = PER_CPU_DATA.get_cpu(cpu_id) {
        data.init(cpu_id, lapic_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lapic_maps() {
        register_cpu_id(5, 0x17);
        assert_eq!(lapic_id_for_cpu(5), Some(0x17));
        assert_eq!(cpu_for_lapic_id(0x17), Some(5));
        assert_eq!(cpu_for_lapic_id(0x200), None);
        assert_eq!(lapic_id_for_cpu(MAX_CPUS), None);
        assert_eq!(lapic_id_for_cpu(63), None);
    }

    #[test]
    fn test_online_mask() {
        assert!(is_cpu_online(0));
        register_cpu_online(9);
        assert!(is_cpu_online(9));
        assert!(online_cpus().contains(0));
        assert!(online_cpu_count() >= 2);
        register_cpu_online(MAX_CPUS);
    }

    #[test]
    fn test_preempt_and_irq_nesting() {
        let data = PerCpuData::new();
        assert!(data.preemptible());
        assert_eq!(data.preempt_disable(), 1);
        assert!(!data.preemptible());
        assert_eq!(data.preempt_enable(), 0);

        data.irq_enter();
        assert!(data.in_irq());
        assert!(!data.preemptible());
        data.irq_exit();
        assert!(data.preemptible());
    }

    #[test]
    fn test_cpu_local_slots() {
        static COUNTERS: CpuLocal<AtomicU64> = CpuLocal::new(|| AtomicU64::new(0));
        if let Some(c) = COUNTERS.get_cpu(3) {
            c.fetch_add(2, Ordering::Relaxed);
        }
        assert_eq!(COUNTERS.get_cpu(3).map(|c| c.load(Ordering::Relaxed)), Some(2));
        assert_eq!(COUNTERS.get_cpu(4).map(|c| c.load(Ordering::Relaxed)), Some(0));
        assert!(COUNTERS.get_cpu(MAX_CPUS).is_none());
    }
}
