//! Error taxonomy for collection mutation.
//!
//! Every variant here is a programmer error in the sense that well-behaved
//! callers can always avoid it by checking first; none of them are raised
//! for ordinary data conditions. They surface as `Err` values so the caller
//! that initiated the mutation decides how loudly to fail.

use thiserror::Error;

/// Errors from keyed-collection and indexed-list operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// `add` was called with a key that is already resident.
    #[error("item with key `{key}` is already present")]
    DuplicateKey { key: String },

    /// An operation addressed a key with no resident item.
    #[error("no item with key `{key}`")]
    MissingKey { key: String },

    /// A rename targeted a key that is already resident.
    #[error("cannot re-key `{from}` to `{to}`: target key is already present")]
    KeyCollision { from: String, to: String },

    /// An insert would give the same item two positions in one list.
    #[error("item is already present in the list at index {index}")]
    ItemAlreadyPresent { index: usize },

    /// An index-addressed operation ran past the end of the list.
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A batch column's row count does not match the addressed items.
    #[error("attribute column `{attr}` has {got} values for {expected} targets")]
    LengthMismatch {
        attr: String,
        expected: usize,
        got: usize,
    },

    /// Keys are re-keyed through `rename`, never through a batch write.
    #[error("attribute `key` cannot be written by a batch; use rename")]
    ReservedAttribute,
}

/// Convenience alias used throughout the collection layer.
pub type Result<T> = std::result::Result<T, ModelError>;
