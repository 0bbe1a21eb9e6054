//! Error taxonomy and the thread-local last-error channel.
//!
//! Every fallible operation in this crate returns a [`Result<T, ErrorKind>`]
//! — the idiomatic surface — and, as a side effect, records the same
//! [`ErrorKind`] in a thread-local cell so that callers working with raw
//! pointers (e.g. through [`Pool::alloc_ptr`](crate::pool::Pool::alloc_ptr))
//! can recover the reason for a `null` return without threading a `Result`
//! through an FFI boundary.

use std::cell::RefCell;
use std::fmt;

use thiserror::Error;

/// The stable set of error kinds this crate can report.
///
/// New variants may be added in a future minor version; match on this type
/// with a wildcard arm.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The last operation on this thread completed successfully.
    #[error("no error")]
    None,

    /// A request of size zero, a non-power-of-two alignment, a full class
    /// table, or an overflowing `calloc` multiplication.
    #[error("invalid allocation request: {reason}")]
    InvalidSize {
        /// What made the request invalid.
        reason: &'static str,
    },

    /// No free block (or class slot) large enough exists, and chain growth
    /// was refused or itself failed.
    #[error("pool exhausted: requested {requested} bytes, capacity is {capacity} bytes")]
    OutOfMemory {
        /// The size that could not be satisfied.
        requested: usize,
        /// The total capacity of the pool (or class) that was consulted.
        capacity: usize,
    },

    /// A pointer is not owned by any link of the chain, or its header magic
    /// does not match.
    #[error("pointer {ptr:#x} is not owned by this pool, or its header is corrupt")]
    InvalidPointer {
        /// The address that failed validation.
        ptr: usize,
    },

    /// A pointer was already in the free state when `free` was called again.
    #[error("pointer {ptr:#x} was already freed")]
    DoubleFree {
        /// The address that was double-freed.
        ptr: usize,
    },

    /// `validate` found an invariant violation.
    #[error("corruption detected in {component}: {detail}")]
    Corruption {
        /// The component where the violation was observed (e.g. `"heap"`).
        component: &'static str,
        /// A short, human-readable description of the violation.
        detail: String,
    },
}

impl ErrorKind {
    /// Returns `true` for [`ErrorKind::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, ErrorKind::None)
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::None
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, ErrorKind>;

thread_local! {
    static LAST_ERROR: RefCell<ErrorKind> = const { RefCell::new(ErrorKind::None) };
}

/// Returns the last error recorded on the calling thread, or
/// [`ErrorKind::None`] if the most recent fallible call succeeded.
///
/// This mirrors the last-error channel of the allocator this crate is
/// modeled on, for callers that only hold a raw pointer back from an
/// operation and need to recover why it was null.
pub fn last_error() -> ErrorKind {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

pub(crate) fn set_last_error(kind: ErrorKind) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = kind);
}

pub(crate) fn clear_last_error() {
    set_last_error(ErrorKind::None);
}

/// Records `result`'s error (or the absence of one) on the thread-local
/// channel and passes it through unchanged.
pub(crate) fn record<T>(result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => clear_last_error(),
        Err(kind) => set_last_error(kind.clone()),
    }
    result
}

impl fmt::Display for RawErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A small FFI-friendly numeric encoding of [`ErrorKind`], for callers that
/// cannot hold a Rust enum across a C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawErrorCode(u8);

impl From<&ErrorKind> for RawErrorCode {
    fn from(kind: &ErrorKind) -> Self {
        RawErrorCode(match kind {
            ErrorKind::None => 0,
            ErrorKind::InvalidSize { .. } => 1,
            ErrorKind::OutOfMemory { .. } => 2,
            ErrorKind::InvalidPointer { .. } => 3,
            ErrorKind::DoubleFree { .. } => 4,
            ErrorKind::Corruption { .. } => 5,
        })
    }
}
