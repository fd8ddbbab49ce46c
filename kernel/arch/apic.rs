//! Local APIC access for inter-processor interrupts.
//!
//! Only the registers the shootdown path needs: the interrupt command
//! register for sending, and EOI for the handler's exit.
//!
//! ```text
//! ICR_HIGH  [31:24] destination LAPIC ID
//! ICR_LOW   [7:0] vector  [10:8] delivery  [12] pending
//!           [14] level    [15] trigger     [19:18] shorthand
//! ```

use core::ptr::{read_volatile, write_volatile};

/// LAPIC base address, identity mapped by early boot (xAPIC mode)
pub const LAPIC_BASE: u64 = 0xFEE0_0000;

/// LAPIC register offsets
pub mod lapic {
    pub const EOI: u32 = 0x0B0; // End of Interrupt
    pub const ICR_LOW: u32 = 0x300; // Interrupt Command Register (low)
    pub const ICR_HIGH: u32 = 0x310; // Interrupt Command Register (high)
}

/// ICR delivery modes
pub mod icr_delivery {
    pub const FIXED: u32 = 0 << 8;
}

/// ICR destination shorthands
pub mod icr_dest {
    pub const NO_SHORTHAND: u32 = 0 << 18;
    pub const ALL_EXCLUDING_SELF: u32 = 3 << 18;
}

/// ICR flags
pub mod icr_flags {
    /// Level assert (required for everything but INIT de-assert)
    pub const LEVEL_ASSERT: u32 = 1 << 14;
    /// Edge triggered
    pub const TRIGGER_EDGE: u32 = 0 << 15;
    /// Delivery status: set while the previous IPI is still being sent
    pub const DELIVERY_PENDING: u32 = 1 << 12;
}

/// Read a LAPIC register
///
/// # Safety
///
/// The LAPIC must be mapped at `LAPIC_BASE`.
#[inline]
pub unsafe fn lapic_read(reg: u32) -> u32 {
    let addr = (LAPIC_BASE + reg as u64) as *const u32;
    read_volatile(addr)
}

/// Write to a LAPIC register
///
/// # Safety
///
/// The LAPIC must be mapped at `LAPIC_BASE`.
#[inline]
pub unsafe fn lapic_write(reg: u32, value: u32) {
    let addr = (LAPIC_BASE + reg as u64) as *mut u32;
    write_volatile(addr, value);
}

/// Send End of Interrupt to LAPIC
///
/// # Safety
///
/// Must be called in interrupt context after handling the interrupt.
#[inline]
pub unsafe fn lapic_eoi() {
    lapic_write(lapic::EOI, 0);
}

/// ICR low word for an edge-triggered, asserted IPI.
#[inline]
pub const fn icr_low(vector: u8, delivery_mode: u32, shorthand: u32) -> u32 {
    (vector as u32)
        | delivery_mode
        | shorthand
        | icr_flags::LEVEL_ASSERT
        | icr_flags::TRIGGER_EDGE
}

/// Wait for ICR delivery to complete
///
/// # Safety
///
/// LAPIC must be initialized.
unsafe fn wait_icr_idle() {
    while lapic_read(lapic::ICR_LOW) & icr_flags::DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Send an IPI to a specific LAPIC ID
///
/// # Safety
///
/// LAPIC must be initialized. The vector must be valid for the delivery mode.
pub unsafe fn send_ipi_raw(dest_lapic_id: u32, vector: u8, delivery_mode: u32) {
    wait_icr_idle();

    lapic_write(lapic::ICR_HIGH, dest_lapic_id << 24);
    // Writing ICR low sends the IPI
    lapic_write(
        lapic::ICR_LOW,
        icr_low(vector, delivery_mode, icr_dest::NO_SHORTHAND),
    );
}

/// Broadcast an IPI to all CPUs except self
///
/// # Safety
///
/// LAPIC must be initialized.
pub unsafe fn broadcast_ipi_all_except_self(vector: u8) {
    wait_icr_idle();

    lapic_write(lapic::ICR_HIGH, 0);
    lapic_write(
        lapic::ICR_LOW,
        icr_low(vector, icr_delivery::FIXED, icr_dest::ALL_EXCLUDING_SELF),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icr_low_encoding() {
        assert_eq!(
            icr_low(0xFE, icr_delivery::FIXED, icr_dest::NO_SHORTHAND),
            0x0000_40FE
        );
        assert_eq!(
            icr_low(0xFE, icr_delivery::FIXED, icr_dest::ALL_EXCLUDING_SELF),
            0x000C_40FE
        );
        // Never leaves the pending bit set
        assert_eq!(
            icr_low(0xFF, icr_delivery::FIXED, icr_dest::ALL_EXCLUDING_SELF)
                & icr_flags::DELIVERY_PENDING,
            0
        );
    }
}
