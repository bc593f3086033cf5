//! Protocol-level error types.

use thiserror::Error;

use crate::path::PathKind;

/// Malformed input at the protocol layer.
///
/// Every variant maps to a Bad-Request response when it is caused by a
/// request from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Path text does not begin with `/`.
    #[error("path must start with '/': {text:?}")]
    MissingRootSeparator {
        /// The offending text.
        text: String,
    },

    /// More than four segments.
    #[error("path has {count} segments, at most 4 allowed")]
    TooManySegments {
        /// Number of segments found.
        count: usize,
    },

    /// A segment is not a non-negative 16-bit integer literal.
    #[error("path segment is not an integer: {segment:?}")]
    InvalidSegment {
        /// The offending segment.
        segment: String,
    },

    /// Path parsed, but has the wrong arity for the requested kind.
    #[error("expected {expected} path, got {actual} path")]
    ArityMismatch {
        /// Kind the caller required.
        expected: PathKind,
        /// Kind that was parsed.
        actual: PathKind,
    },

    /// Payload shape does not fit the operation.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// What was wrong.
        reason: String,
    },

    /// Operation is not valid for the addressed node.
    #[error("{method} not applicable to {target}")]
    UnsupportedTarget {
        /// Method name.
        method: String,
        /// Rendered target path.
        target: String,
    },

    /// Wire envelope could not be encoded or decoded.
    #[error("wire codec error: {0}")]
    Codec(String),
}
