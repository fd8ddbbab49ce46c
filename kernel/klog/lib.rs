//! Zero-OS kernel logging (`klog`).
//!
//! Profile-aware logging macros shared by every kernel sub-crate, including
//! the lowest layers (per-CPU data, TLB shootdown, IPI plumbing).
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Boot banners, status messages |
//! | [`klog_force!`] | Active | No | Pre-panic diagnostics, critical errors |
//!
//! # Output
//!
//! Records are emitted through the [`log`] facade with target `"klog"`, so
//! whichever logger the boot path installs (serial console, ring buffer, or a
//! test capture) receives them. With no logger installed every macro is a
//! cheap no-op after the profile check.
//!
//! # Hardening Profile Integration
//!
//! Filtering is **runtime** and derived from the active hardening profile via
//! [`set_profile`]:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! Checking a level costs one `Relaxed` load, so the TLB shootdown IPI
//! handler can log at `Trace` from interrupt context.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Per-IPI and per-round tracing; debug builds only.
    Trace = 0,
    /// Slow paths worth seeing while developing; debug builds only.
    Debug = 1,
    Info = 2,
    Warn = 3,
    /// Broken invariants, usually followed by a panic.
    Error = 4,
}

impl Level {
    /// The matching `log` crate level.
    #[inline]
    pub const fn as_log(self) -> log::Level {
        match self {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Lowest level emitted; DISABLED until [`set_profile`] runs.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`]. Fail-closed until [`set_profile`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profile selected by the boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// Maximum security, no klog output.
    Secure = 0,
    /// Balanced: errors and warnings only.
    Balanced = 1,
    /// Performance/debug: all levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Called once during early boot; safe to call again if the profile changes.
/// The Secure profile also suppresses [`klog_always!`].
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Helpers (not public API, used by macros)
// ============================================================================

/// Log target used for every klog record.
pub const TARGET: &str = "klog";

#[doc(hidden)]
#[inline]
pub fn _klog_emit(level: Level, args: core::fmt::Arguments) {
    log::logger().log(
        &log::Record::builder()
            .args(args)
            .level(level.as_log())
            .target(TARGET)
            .build(),
    );
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated kernel output (boot banners, status messages).
///
/// Suppressed in [`KlogProfile::Secure`]. Use [`klog_force!`] for output that
/// must appear regardless of profile.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_emit($crate::Level::Info, format_args!($($arg)+));
        }
    }};
}

/// Unconditional kernel output, never suppressed by any profile.
///
/// Reserved for critical diagnostics immediately before `panic!()`, such as a
/// TLB shootdown invariant violation.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_klog_emit($crate::Level::Error, format_args!($($arg)+));
    }};
}

/// Profile-aware kernel logging.
///
/// `Debug` and `Trace` are dead code in release builds; their arguments are
/// still type-checked.
///
/// ```ignore
/// klog!(Warn,  "tlb: mailbox contended for {} spins", spins);
/// klog!(Info,  "SMP: {} CPUs online", count);
/// klog!(Trace, "tlb: cpu {} acked gen {}", cpu, gen);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_emit($crate::Level::Error, format_args!($($arg)+));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_emit($crate::Level::Warn, format_args!($($arg)+));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_emit($crate::Level::Info, format_args!($($arg)+));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        if cfg!(debug_assertions) && $crate::enabled($crate::Level::Debug) {
            $crate::_klog_emit($crate::Level::Debug, format_args!($($arg)+));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        if cfg!(debug_assertions) && $crate::enabled($crate::Level::Trace) {
            $crate::_klog_emit($crate::Level::Trace, format_args!($($arg)+));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the filter is process-global.
    #[test]
    fn test_profile_filter() {
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());

        set_profile(KlogProfile::Balanced);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
        assert!(!enabled(Level::Info));
        assert!(_klog_always_enabled());

        set_profile(KlogProfile::Performance);
        assert!(enabled(Level::Trace));
        klog!(Trace, "trace record {}", 1);
        klog_always!("banner");

        disable();
        assert!(!enabled(Level::Error));
        assert!(_klog_always_enabled());

        set_profile(KlogProfile::Secure);
        assert!(!enabled(Level::Error));
        assert!(!_klog_always_enabled());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(Level::Warn.as_log(), log::Level::Warn);
        assert!(Level::Trace < Level::Error);
    }
}
