//! Boot-time configuration of a shootdown coordinator.

use core::fmt;

use cpu_local::MAX_CPUS;
use x86_64::VirtAddr;

/// Base page size.
pub const PAGE_SIZE: u64 = 4096;

/// Large (PS) page size; large-page requests are aligned down to this.
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Configuration errors detected before any shootdown runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Kernel address-space base is zero.
    ZeroKernelBase,
    /// Kernel address-space base is not page aligned.
    UnalignedKernelBase(u64),
    /// Kernel address-space base is not a canonical address.
    NonCanonicalKernelBase(u64),
    /// The platform may bring up more processors than a CPU mask holds.
    TooManyCpus { ncpu: usize, max: usize },
    /// A running processor lies outside `0..ncpu`.
    CpuOutOfRange { cpu: usize, ncpu: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroKernelBase => write!(f, "kernel base address is zero"),
            ConfigError::UnalignedKernelBase(base) => {
                write!(f, "kernel base {:#x} is not page aligned", base)
            }
            ConfigError::NonCanonicalKernelBase(base) => {
                write!(f, "kernel base {:#x} is not canonical", base)
            }
            ConfigError::TooManyCpus { ncpu, max } => {
                write!(f, "{} CPUs exceed the {} CPU shootdown mask", ncpu, max)
            }
            ConfigError::CpuOutOfRange { cpu, ncpu } => {
                write!(f, "running CPU {} outside 0..{}", cpu, ncpu)
            }
        }
    }
}

/// Runtime parameters of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShootdownConfig {
    kernel_base: u64,
}

impl ShootdownConfig {
    /// x86_64 higher half: user space ends below `0xFFFF_8000_0000_0000`.
    pub const X86_64: Self = Self {
        kernel_base: 0xFFFF_8000_0000_0000,
    };

    /// Validate a kernel address-space base.
    ///
    /// Requests at or above `kernel_base` against a user space also target
    /// every processor holding that space's kernel half.
    pub fn new(kernel_base: u64) -> Result<Self, ConfigError> {
        if kernel_base == 0 {
            return Err(ConfigError::ZeroKernelBase);
        }
        if kernel_base % PAGE_SIZE != 0 {
            return Err(ConfigError::UnalignedKernelBase(kernel_base));
        }
        if VirtAddr::try_new(kernel_base).is_err() {
            return Err(ConfigError::NonCanonicalKernelBase(kernel_base));
        }
        Ok(Self { kernel_base })
    }

    #[inline]
    pub fn kernel_base(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.kernel_base)
    }

    /// Whether `va` lies in the kernel range.
    #[inline]
    pub fn is_kernel_va(&self, va: VirtAddr) -> bool {
        va.as_u64() >= self.kernel_base
    }

    /// Validate a processor count against the CPU mask width.
    pub fn check_ncpu(ncpu: usize) -> Result<(), ConfigError> {
        if ncpu > MAX_CPUS {
            return Err(ConfigError::TooManyCpus {
                ncpu,
                max: MAX_CPUS,
            });
        }
        Ok(())
    }
}

impl Default for ShootdownConfig {
    fn default() -> Self {
        Self::X86_64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_base_validation() {
        assert_eq!(ShootdownConfig::new(0), Err(ConfigError::ZeroKernelBase));
        assert_eq!(
            ShootdownConfig::new(0xFFFF_8000_0000_0010),
            Err(ConfigError::UnalignedKernelBase(0xFFFF_8000_0000_0010))
        );
        assert_eq!(
            ShootdownConfig::new(0x0000_8000_0000_0000),
            Err(ConfigError::NonCanonicalKernelBase(0x0000_8000_0000_0000))
        );
        let cfg = ShootdownConfig::new(0xFFFF_8000_0000_0000).unwrap();
        assert_eq!(cfg, ShootdownConfig::default());
        assert!(cfg.is_kernel_va(VirtAddr::new(0xFFFF_FFFF_8000_0000)));
        assert!(!cfg.is_kernel_va(VirtAddr::new(0x7FFF_FFFF_F000)));
    }

    #[test]
    fn test_ncpu_limit() {
        assert!(ShootdownConfig::check_ncpu(MAX_CPUS).is_ok());
        let err = ShootdownConfig::check_ncpu(MAX_CPUS + 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("{} CPUs exceed the {} CPU shootdown mask", MAX_CPUS + 1, MAX_CPUS)
        );
    }
}
