//! Engine error kinds and conversions

use std::io;
use thiserror::Error;

/// Errors that can arise while constructing or stepping the engine.
///
/// Each variant corresponds to one of the ISA-level error kinds:
/// construction-time misconfiguration, malformed syscall/download
/// arguments, malformed or disallowed instructions, out-of-bounds or
/// permission-violating memory access, overlapping segment maps,
/// oversized downloads, and a catch-all for anything else that escapes a
/// step.
#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineError {
    /// Construction-time invalid input (bad vfile types, bad source file).
    #[error("bad config: {0}")]
    BadConfig(String),

    /// Invalid syscall or download arguments (blacklisted scheme, loopback host, ...).
    #[error("bad args: {0}")]
    BadArgs(String),

    /// Unknown mnemonic, invalid operand, or a disallowed operand form.
    #[error("bad instruction: {0}")]
    BadInst(String),

    /// Address not mapped by any segment, or a permission violation.
    #[error("segmentation fault: {0}")]
    SegFault(String),

    /// A segment map request overlapped an existing segment.
    #[error("allocation failed: {0}")]
    AllocFail(String),

    /// A downloaded file exceeded the configured size limit.
    #[error("invalid source file: {0}")]
    InvalidSourceFile(String),

    /// Catch-all normalization for errors that aren't ISA-level.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Short machine-readable tag for the error kind, carried on ERROR events.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadConfig(_) => "BAD_CONFIG",
            Self::BadArgs(_) => "BAD_ARGS",
            Self::BadInst(_) => "BAD_INST",
            Self::SegFault(_) => "SEG_FAULT",
            Self::AllocFail(_) => "ALLOC_FAIL",
            Self::InvalidSourceFile(_) => "INVALID_SOURCE_FILE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    pub(crate) fn bad_inst<M: Into<String>>(msg: M) -> Self {
        Self::BadInst(msg.into())
    }

    pub(crate) fn seg_fault<M: Into<String>>(msg: M) -> Self {
        Self::SegFault(msg.into())
    }

    pub(crate) fn alloc_fail<M: Into<String>>(msg: M) -> Self {
        Self::AllocFail(msg.into())
    }

    pub(crate) fn bad_args<M: Into<String>>(msg: M) -> Self {
        Self::BadArgs(msg.into())
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        Self::Unknown(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::BadArgs(e.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(e: url::ParseError) -> Self {
        Self::BadArgs(e.to_string())
    }
}

/// Convenient alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
