//! Custom error types for vmi-core

use super::{MemorySpan, ModuleHandle, ProcessFlags, ProcessHandle, SubscriptionId};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a guest backend implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuestError {
    #[error("Guest memory unreadable: {0}")]
    Unreadable(String),

    #[error("Breakpoint limit reached ({0} planted)")]
    BreakpointLimit(usize),

    #[error("Unknown guest object: {0}")]
    UnknownObject(String),
}

/// Main error type for introspection operations
#[derive(Error, Debug)]
pub enum VmiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid process flags: is_x86={is_x86}, is_x64={is_x64}")]
    InvalidFlags { is_x86: bool, is_x64: bool },

    #[error("Callback of {subscription} failed: {reason}")]
    CallbackFailed {
        subscription: SubscriptionId,
        reason: String,
    },

    #[error("Wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Module span {span} overlaps a loaded module of process {process}")]
    OverlappingModule {
        process: ProcessHandle,
        span: MemorySpan,
    },

    #[error("Invalid guest address: {0}")]
    InvalidAddress(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Guest backend error: {0}")]
    Guest(#[from] GuestError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for introspection operations
pub type VmiResult<T> = Result<T, VmiError>;

impl VmiError {
    /// Creates a not-found error for a stale or unknown process handle
    pub fn process_not_found(handle: ProcessHandle) -> Self {
        VmiError::NotFound(format!("process {}", handle))
    }

    /// Creates a not-found error for a stale or unknown module handle
    pub fn module_not_found(handle: ModuleHandle) -> Self {
        VmiError::NotFound(format!("module {}", handle))
    }

    /// Creates an invalid flags error from a malformed bitness descriptor
    pub fn invalid_flags(flags: ProcessFlags) -> Self {
        VmiError::InvalidFlags {
            is_x86: flags.is_x86,
            is_x64: flags.is_x64,
        }
    }

    /// Creates a callback failure error
    pub fn callback_failed(subscription: SubscriptionId, reason: impl Into<String>) -> Self {
        VmiError::CallbackFailed {
            subscription,
            reason: reason.into(),
        }
    }

    /// Creates an enumeration failure error
    pub fn enumeration_failed(reason: impl Into<String>) -> Self {
        VmiError::EnumerationFailed(reason.into())
    }

    pub(crate) fn invalid_handle_bytes(kind: &str, expected: usize, actual: usize) -> Self {
        VmiError::InvalidHandle(format!(
            "{} handle needs {} bytes, got {}",
            kind, expected, actual
        ))
    }

    /// Whether this is a not-found error, as for a stale handle
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmiError::NotFound(_))
    }
}
