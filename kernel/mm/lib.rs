//! Memory management: cross-processor TLB shootdown.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate klog;

pub mod tlb_shootdown;

pub use tlb_shootdown::{
    ConfigError, CpuId, CpuTlb, FlushScope, PendingTicket, Residency, ShootdownConfig, Space,
    TlbFeatures, TlbPlatform, TlbShootdown, TlbShootdownStats, TlbState, TlbWhy,
};
