//! Error taxonomy for the decode engine
//!
//! Caller mistakes fail synchronously with [`ValidationError`] before any
//! state changes. Everything that happens after a request is accepted is
//! reported through the request's event channel as a [`RejectReason`].

use thiserror::Error;

/// Malformed caller input, detected before any engine state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The frame-number list was empty
    #[error("frame number list is empty")]
    EmptyFrameNumbers,
    /// The frame-number list was not strictly ascending
    #[error("frame numbers must be strictly ascending: {prev} followed by {next}")]
    NonAscendingFrameNumbers { prev: u32, next: u32 },
    /// The provider was closed; no further submissions are accepted
    #[error("frame provider is closed")]
    Closed,
}

/// Why an accepted request did not complete.
///
/// `Outdated` is expected steady-state traffic during fast scrubbing, not a
/// fault: the caller should resubmit if the chunk is still wanted. A request
/// receives at most one rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// The request was superseded by a newer submission
    #[error("request superseded by a newer one")]
    Outdated,
    /// The decode worker reported a failure for this chunk
    #[error("decode worker failed: {0}")]
    Worker(String),
}
