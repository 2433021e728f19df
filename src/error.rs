//! Crate-wide error kinds.

use thiserror::Error;

/// Errors surfaced by the stores, the cache and the storage layer.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation required a root that has not been initialised.
    #[error("tree has not been initialised")]
    TreeEmpty,

    /// Lookup or remove on an absent key.
    #[error("key not found")]
    KeyNotFound,

    /// A structural invariant was violated. The operation is aborted and
    /// the tree state must be considered undefined; callers must not retry.
    #[error("structural invariant violated: {0}")]
    Internal(&'static str),

    /// The backing storage failed. The affected handle is poisoned.
    #[error("backing storage failed")]
    Io(#[from] std::io::Error),

    /// Operation not representable, e.g. an update buffered after a delete.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Whether this error leaves the tree in a defined state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TreeEmpty | Error::KeyNotFound | Error::Unsupported(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
