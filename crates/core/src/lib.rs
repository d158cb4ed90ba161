// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod clock;
pub mod iox;
pub mod memory;
pub mod pdc;
pub mod peripherals;
pub mod sd;
pub mod system;

pub use system::Soc;

/// Errors surfaced by the emulation core, split by origin:
///
/// * `Access` / `MemoryViolation` — the emulated firmware violated a
///   datasheet contract (writing a reserved register, unaligned MMIO, ...).
///   These are deliberately fatal; tolerating them would mask OBSW bugs.
/// * `Unsupported` — the firmware touched a feature the model does not
///   implement. Raised or downgraded to a warning by policy.
/// * `Io` — an external resource (IOX socket, SD image) failed underneath
///   the emulator. Unrecoverable in this model.
/// * `Stalled` — not a failure: the CPU executor must yield and retry after
///   polling, because an SPI channel is waiting for its client echo.
#[derive(Debug, thiserror::Error)]
pub enum SocError {
    #[error("{device}: {reason} [offset {offset:#05x}]")]
    Access {
        device: &'static str,
        offset: u64,
        reason: String,
    },

    #[error("{device}: {feature} not supported")]
    Unsupported {
        device: &'static str,
        feature: String,
    },

    #[error("memory access violation at {0:#010x}")]
    MemoryViolation(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CPU access stalled: SPI transfer awaiting client echo")]
    Stalled,
}

impl SocError {
    pub fn illegal_read(device: &'static str, offset: u64) -> Self {
        SocError::Access {
            device,
            offset,
            reason: "illegal read access".to_string(),
        }
    }

    pub fn illegal_write(device: &'static str, offset: u64, value: u32) -> Self {
        SocError::Access {
            device,
            offset,
            reason: format!("illegal write access [value: {value:#010x}]"),
        }
    }

    pub fn access(device: &'static str, offset: u64, reason: impl Into<String>) -> Self {
        SocError::Access {
            device,
            offset,
            reason: reason.into(),
        }
    }

    /// True for the stall pseudo-error, which the executor handles by
    /// yielding instead of aborting.
    pub fn is_stall(&self) -> bool {
        matches!(self, SocError::Stalled)
    }
}

pub type SocResult<T> = Result<T, SocError>;

/// Strictness policy shared by the fabric and the peripherals.
#[derive(Debug, Clone, Copy)]
pub struct SocPolicy {
    /// Abort on unimplemented-region accesses instead of warn-and-zero.
    pub strict_unimplemented: bool,
    /// Abort on unsupported-feature accesses instead of warning.
    pub strict_unsupported: bool,
}

impl Default for SocPolicy {
    fn default() -> Self {
        Self {
            strict_unimplemented: false,
            strict_unsupported: true,
        }
    }
}

impl SocPolicy {
    /// Handle an unsupported-feature access per policy: error when strict,
    /// warn once per call site otherwise.
    pub fn unsupported(
        &self,
        device: &'static str,
        feature: impl Into<String>,
    ) -> SocResult<()> {
        let feature = feature.into();
        if self.strict_unsupported {
            Err(SocError::Unsupported { device, feature })
        } else {
            tracing::warn!("{}: {} not supported", device, feature);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_device_and_offset() {
        let err = SocError::illegal_write("at91.usart0", 0x3C, 0xDEAD_BEEF);
        let msg = err.to_string();
        assert!(msg.contains("at91.usart0"));
        assert!(msg.contains("0x03c"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_policy_unsupported_lenient_vs_strict() {
        let lenient = SocPolicy {
            strict_unsupported: false,
            ..Default::default()
        };
        assert!(lenient.unsupported("at91.tc", "BURST mode").is_ok());

        let strict = SocPolicy::default();
        assert!(strict.unsupported("at91.tc", "BURST mode").is_err());
    }

    #[test]
    fn test_stall_is_not_a_failure() {
        assert!(SocError::Stalled.is_stall());
        assert!(!SocError::MemoryViolation(0).is_stall());
    }
}
