//! Error types for the veilstream core.

use thiserror::Error;

/// Errors returned by the decaying duplicate filter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// Entry length does not match the width the filter was built for.
    #[error("bad entry length {got}, expected {expected}")]
    WrongEntryLength {
        /// Length of the rejected entry.
        got: usize,
        /// Length the filter was constructed for.
        expected: usize,
    },
}
