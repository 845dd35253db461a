// SPDX-License-Identifier: AGPL-3.0-only

//! Advanced Error Reporting extended capability (id 0x0001).
//!
//! ```text
//! +0x00  extended capability header
//! +0x04  uncorrectable error status     (RW1CS)
//! +0x08  uncorrectable error mask
//! +0x0C  uncorrectable error severity
//! +0x10  correctable error status       (RW1CS)
//! +0x14  correctable error mask
//! +0x18  advanced error capabilities and control
//! +0x1C  header log (4 dwords)
//! +0x2C  root error command             (root ports)
//! +0x30  root error status              (root ports)
//! +0x34  error source identification    (root ports)
//! ```

/// Uncorrectable error status.
pub const UE_STATUS: u16 = 0x04;
/// Uncorrectable error mask.
pub const UE_MASK: u16 = 0x08;
/// Uncorrectable error severity.
pub const UE_SEVERITY: u16 = 0x0C;
/// Correctable error status.
pub const CE_STATUS: u16 = 0x10;
/// Correctable error mask.
pub const CE_MASK: u16 = 0x14;
/// Advanced error capabilities and control.
pub const CAP_CTL: u16 = 0x18;
/// First dword of the TLP header log.
pub const HEADER_LOG: u16 = 0x1C;
/// Root error status.
pub const ROOT_STATUS: u16 = 0x30;

/// Number of dwords captured per AER log snapshot (header through source id).
pub const BLOCK_DWORDS: usize = 14;

/// Uncorrectable error status bits.
pub mod ue {
    /// Data link protocol error.
    pub const DATA_LINK_PROTOCOL: u32 = 1 << 4;
    /// Surprise down error.
    pub const SURPRISE_DOWN: u32 = 1 << 5;
    /// Poisoned TLP received.
    pub const POISONED_TLP: u32 = 1 << 12;
    /// Flow control protocol error.
    pub const FLOW_CONTROL: u32 = 1 << 13;
    /// Completion timeout.
    pub const COMPLETION_TIMEOUT: u32 = 1 << 14;
    /// Completer abort.
    pub const COMPLETER_ABORT: u32 = 1 << 15;
    /// Unexpected completion.
    pub const UNEXPECTED_COMPLETION: u32 = 1 << 16;
    /// Receiver overflow.
    pub const RECEIVER_OVERFLOW: u32 = 1 << 17;
    /// Malformed TLP.
    pub const MALFORMED_TLP: u32 = 1 << 18;
    /// ECRC error.
    pub const ECRC: u32 = 1 << 19;
    /// Unsupported request error.
    pub const UNSUPPORTED_REQUEST: u32 = 1 << 20;
    /// ACS violation.
    pub const ACS_VIOLATION: u32 = 1 << 21;
    /// Uncorrectable internal error.
    pub const INTERNAL: u32 = 1 << 22;
    /// MC blocked TLP.
    pub const MC_BLOCKED: u32 = 1 << 23;
    /// AtomicOp egress blocked.
    pub const ATOMIC_EGRESS_BLOCKED: u32 = 1 << 24;
    /// TLP prefix blocked.
    pub const TLP_PREFIX_BLOCKED: u32 = 1 << 25;
    /// Poisoned TLP egress blocked.
    pub const POISONED_EGRESS_BLOCKED: u32 = 1 << 26;

    /// Every bit position the first error pointer may legally name.
    pub const VALID: u32 = DATA_LINK_PROTOCOL
        | SURPRISE_DOWN
        | POISONED_TLP
        | FLOW_CONTROL
        | COMPLETION_TIMEOUT
        | COMPLETER_ABORT
        | UNEXPECTED_COMPLETION
        | RECEIVER_OVERFLOW
        | MALFORMED_TLP
        | ECRC
        | UNSUPPORTED_REQUEST
        | ACS_VIOLATION
        | INTERNAL
        | MC_BLOCKED
        | ATOMIC_EGRESS_BLOCKED
        | TLP_PREFIX_BLOCKED
        | POISONED_EGRESS_BLOCKED;
}

/// Correctable error status bits.
pub mod ce {
    /// Receiver error.
    pub const RECEIVER: u32 = 1 << 0;
    /// Bad TLP.
    pub const BAD_TLP: u32 = 1 << 6;
    /// Bad DLLP.
    pub const BAD_DLLP: u32 = 1 << 7;
    /// REPLAY_NUM rollover.
    pub const REPLAY_ROLLOVER: u32 = 1 << 8;
    /// Replay timer timeout.
    pub const REPLAY_TIMEOUT: u32 = 1 << 12;
    /// Advisory non-fatal error.
    pub const ADVISORY_NON_FATAL: u32 = 1 << 13;
    /// Corrected internal error.
    pub const INTERNAL: u32 = 1 << 14;
    /// Header log overflow.
    pub const HEADER_LOG_OVERFLOW: u32 = 1 << 15;
}

/// Advanced error capabilities and control bits.
pub mod cap_ctl {
    /// First error pointer (bits 4:0).
    pub const FIRST_ERROR_POINTER_MASK: u32 = 0x1F;
    /// Multiple header recording capable.
    pub const MULTI_HEADER_CAPABLE: u32 = 1 << 9;
    /// Multiple header recording enable.
    pub const MULTI_HEADER_ENABLE: u32 = 1 << 10;
}

/// Upper bound on first-error-pointer clear iterations.
///
/// A fault that re-asserts continuously keeps the pointer valid forever;
/// the walk stops after this many clears regardless of bridge family.
pub const MAX_UE_CLEAR_COUNT: u32 = 32;
