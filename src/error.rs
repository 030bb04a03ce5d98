use thiserror::Error;

use crate::data::BatchKey;

/// The error a [`BatchFuture`](crate::BatchFuture) resolves with when it
/// can't deliver a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError<E> {
    /// The handler failed for the whole batch. Every request in that batch
    /// receives a clone of the same error.
    #[error("batch handler failed: {0}")]
    Handler(E),

    /// The handler returned fewer values than it was given params, so this
    /// request has no value. Requests at earlier positions are unaffected.
    #[error(
        "batch handler for '{key}' returned {received} values for {expected} params; \
         no value at position {position}"
    )]
    LengthMismatch {
        key: BatchKey,
        expected: usize,
        received: usize,
        position: usize,
    },
}

impl<E> FetchError<E> {
    /// Get the handler's error, if this is a handler failure.
    pub fn handler_error(&self) -> Option<&E> {
        match self {
            FetchError::Handler(err) => Some(err),
            FetchError::LengthMismatch { .. } => None,
        }
    }
}

/// Errors from [`CoalescerRegistry`](crate::CoalescerRegistry) lookups and
/// registrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a coalescer is already registered for '{0}'")]
    DuplicateKey(BatchKey),

    #[error("no coalescer is registered for '{0}'")]
    UnknownKey(BatchKey),
}
