//! # Error Types
//!
//! Purpose: Define the engine's Rust-ergonomic error type and its mapping
//! onto the wire-stable status ordinals the façade returns to callers.
//!
//! ## Design Principles
//!
//! 1. **One Error, Two Views**: `HkvError` carries human-readable context for
//!    `Display`/logging, while `HkvError::status()` gives the stable
//!    `Status` ordinal a front-end or test harness can match on.
//! 2. **No Exceptions Cross the Façade**: every façade operation returns
//!    `Result<T, HkvError>`; panics are reserved for invariant violations
//!    that indicate a bug in the engine itself, never for client input.
//! 3. **Stable Ordinals**: `Status` discriminants are fixed by spec and must
//!    never be renumbered, since they are meant to be wire-stable.

use std::fmt;

use crate::ops::Status;

/// Result alias used throughout the engine crates.
pub type HkvResult<T> = Result<T, HkvError>;

/// Engine error type.
///
/// Each variant maps onto exactly one [`Status`] ordinal via
/// [`HkvError::status`]; multiple variants may map onto the same ordinal
/// when the wire-visible outcome is identical but the Rust-side diagnostic
/// differs (e.g. `KeyTooLong` and `KeyEmpty` both surface `Status::Einval`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HkvError {
    /// Key absent, or present but expired/flushed.
    #[error("key not found")]
    KeyNotFound,

    /// Key present but the supplied CAS did not match the current version.
    #[error("key exists with a different cas value")]
    CasMismatch,

    /// `nkey` was zero or exceeded `KEY_MAX`.
    #[error("key length {len} is out of bounds (1..={max})")]
    KeyTooLong { len: usize, max: usize },

    /// `nbytes` exceeded the configured `item_size_max`.
    #[error("value length {len} exceeds the configured maximum of {max}")]
    ValueTooLarge { len: usize, max: usize },

    /// The slab allocator and eviction engine could not satisfy a request
    /// within the configured memory budget.
    #[error("out of memory for the requested size class")]
    OutOfMemory,

    /// `ADD`/`REPLACE`/`APPEND`/`PREPEND` preconditions were not met.
    #[error("item not stored")]
    NotStored,

    /// Malformed or out-of-range configuration string.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Existing value is not a valid ASCII-encoded unsigned 64-bit integer.
    #[error("value is not a valid unsigned integer")]
    NotANumber,

    /// Operation is not supported by this engine build/version.
    #[error("operation not supported")]
    Unsupported,

    /// Operation would have blocked; caller must await `notify_io_complete`
    /// and re-drive the same request.
    #[error("operation would block")]
    WouldBlock,

    /// Caller must resubmit with more payload before the engine can proceed.
    #[error("more data required")]
    WantMore,

    /// The engine has entered an unrecoverable state for this handle; it
    /// should stop accepting new work.
    #[error("unrecoverable engine failure: {reason}")]
    Failed { reason: String },
}

impl HkvError {
    /// Maps this error onto its wire-stable [`Status`] ordinal.
    pub const fn status(&self) -> Status {
        match self {
            HkvError::KeyNotFound => Status::KeyEnoent,
            HkvError::CasMismatch => Status::KeyEexists,
            HkvError::KeyTooLong { .. } => Status::Einval,
            HkvError::ValueTooLarge { .. } => Status::E2big,
            HkvError::OutOfMemory => Status::Enomem,
            HkvError::NotStored => Status::NotStored,
            HkvError::InvalidConfig { .. } => Status::Einval,
            HkvError::NotANumber => Status::Einval,
            HkvError::Unsupported => Status::Enotsup,
            HkvError::WouldBlock => Status::Ewouldblock,
            HkvError::WantMore => Status::WantMore,
            HkvError::Failed { .. } => Status::Failed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
