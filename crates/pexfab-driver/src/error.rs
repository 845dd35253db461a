// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for bridge fabric operations

use crate::address::PciAddress;
use thiserror::Error;

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, PexError>;

/// Errors that can occur while discovering or managing the fabric
#[derive(Debug, Error)]
pub enum PexError {
    /// Downstream port index out of range
    #[error("Port index {index} out of range (device has {count} downstream ports)")]
    InvalidPort {
        /// Requested index
        index: usize,
        /// Number of downstream ports
        count: usize,
    },

    /// A required capability is not implemented by the port
    #[error("{addr}: {capability} capability not present")]
    MissingCapability {
        /// Port address
        addr: PciAddress,
        /// Capability name
        capability: &'static str,
    },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error from the platform
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Register read or write failed
    #[error("{addr} register {offset:#05x}: {reason}")]
    RegisterAccess {
        /// Port address
        addr: PciAddress,
        /// Register offset
        offset: u16,
        /// Reason for failure
        reason: String,
    },

    /// Mapping an MMIO window failed
    #[error("MMIO mapping failed: {reason}")]
    MapFailed {
        /// Reason for failure
        reason: String,
    },

    /// Request exceeds what the hardware or policy allows
    #[error("Capability mismatch: {reason}")]
    CapabilityMismatch {
        /// Reason for rejection
        reason: String,
    },

    /// Operation not supported by this platform or bridge family
    #[error("Unsupported: {reason}")]
    Unsupported {
        /// Reason
        reason: String,
    },

    /// Polled hardware transition did not complete
    #[error("Timeout after {duration_ms}ms waiting for {what}")]
    Timeout {
        /// What was being polled
        what: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Device or port lookup failed
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// A name or value could not be parsed
    #[error("Invalid {kind} '{value}'")]
    InvalidValue {
        /// What was being parsed
        kind: &'static str,
        /// Offending input
        value: String,
    },

    /// Saved setting session does not exist
    #[error("No saved setting session {id}")]
    NoSession {
        /// Session id
        id: u32,
    },

    /// Enumeration produced an inconsistent bus topology
    #[error("Topology error: {reason}")]
    Topology {
        /// Reason
        reason: String,
    },
}

impl PexError {
    /// Create a register access error
    pub fn register_access(addr: PciAddress, offset: u16, reason: impl Into<String>) -> Self {
        Self::RegisterAccess {
            addr,
            offset,
            reason: reason.into(),
        }
    }

    /// Create a missing capability error
    pub const fn missing_capability(addr: PciAddress, capability: &'static str) -> Self {
        Self::MissingCapability { addr, capability }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a mapping failure error
    pub fn map_failed(reason: impl Into<String>) -> Self {
        Self::MapFailed {
            reason: reason.into(),
        }
    }

    /// Create a capability mismatch error
    pub fn capability_mismatch(reason: impl Into<String>) -> Self {
        Self::CapabilityMismatch {
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            duration_ms,
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an invalid value error
    pub fn invalid_value(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            kind,
            value: value.into(),
        }
    }

    /// Create a topology error
    pub fn topology(reason: impl Into<String>) -> Self {
        Self::Topology {
            reason: reason.into(),
        }
    }
}

/// First-error accumulator for cleanup and restore paths.
///
/// Every step still runs; [`StickyError::finish`] reports the first failure.
#[derive(Debug, Default)]
pub struct StickyError {
    first: Option<PexError>,
    failures: usize,
}

impl StickyError {
    /// Create an empty accumulator
    pub const fn new() -> Self {
        Self {
            first: None,
            failures: 0,
        }
    }

    /// Record the outcome of one step
    pub fn record<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failures += 1;
                if self.first.is_none() {
                    tracing::error!("{step} failed: {e}");
                    self.first = Some(e);
                } else {
                    tracing::debug!("{step} failed after an earlier error: {e}");
                }
                None
            }
        }
    }

    /// Number of failed steps so far
    pub const fn failures(&self) -> usize {
        self.failures
    }

    /// Return the first recorded error, if any
    ///
    /// # Errors
    ///
    /// Returns the first error passed to [`StickyError::record`].
    pub fn finish(self) -> Result<()> {
        self.first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_keeps_first_error_and_runs_all_steps() {
        let mut sticky = StickyError::new();
        let mut ran = 0;
        for i in 0..3 {
            ran += 1;
            let r: Result<()> = if i == 0 {
                Ok(())
            } else {
                Err(PexError::not_found(format!("step {i}")))
            };
            sticky.record("step", r);
        }
        assert_eq!(ran, 3);
        assert_eq!(sticky.failures(), 2);
        match sticky.finish() {
            Err(PexError::NotFound { what }) => assert_eq!(what, "step 1"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
