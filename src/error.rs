//! # Error Kinds
//!
//! User and resource errors carry a typed kind so callers can react to
//! specific failures (a full catalog, a capped collection that cannot make
//! room) without parsing messages. The kinds are wrapped in `eyre::Report`
//! and can be recovered with `Report::downcast_ref::<ErrorKind>()`.
//!
//! Invariant violations (corrupted free-list pointer, missing overflow
//! record) are ordinary `eyre` reports produced with `ensure!`/`bail!` and
//! are not meant to be matched on.

use thiserror::Error;

/// Error code raised when an operation is interrupted at a yield point.
pub const INTERRUPTED: u32 = 11600;
/// Variant raised when the current operation specifically was killed.
pub const INTERRUPTED_KILLED: u32 = 11601;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("namespace name too long, max size is {max}: '{name}'")]
    NameTooLong { name: String, max: usize },

    #[error("namespace '{0}' already exists")]
    DuplicateNamespace(String),

    #[error("too many namespaces/collections")]
    CatalogFull,

    #[error("no space in capped collection and deletes are disallowed")]
    CappedFull,

    #[error("bad hint: no index matching '{0}'")]
    BadHint(String),

    #[error("add index fails, too many indexes for {0}")]
    TooManyIndexes(String),

    #[error("extent allocation failed for {ns}: requested {requested} bytes")]
    ExtentAllocFailed { ns: String, requested: usize },

    #[error("operation interrupted (code {0})")]
    Interrupted(u32),
}

impl ErrorKind {
    /// True for errors a caller is expected to handle rather than propagate
    /// as a failure of the engine itself.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, ErrorKind::ExtentAllocFailed { .. })
    }
}
