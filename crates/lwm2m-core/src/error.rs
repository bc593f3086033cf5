//! Core error types.

use lwm2m_proto::{Path, ProtocolError, ResponseCode};
use thiserror::Error;

use crate::registry::Ssid;

/// Outcome of a request that could not be served.
///
/// Every variant maps onto exactly one response code via
/// [`RequestError::code`]. Dropped traffic is not an error: admission
/// answers with [`crate::bootstrap::Admission::Drop`] and nothing is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Malformed path, wrong arity or unusable payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Target object, instance or resource does not exist.
    #[error("{0} not found")]
    NotFound(Path),

    /// The requesting server lacks the required access right.
    #[error("unauthorized")]
    Unauthorized,

    /// The targeted server's own session is down (e.g. it was disabled).
    #[error("server {ssid} is not registered")]
    ServerUnavailable {
        /// Server the operation refers to.
        ssid: Ssid,
    },

    /// Method not applicable to the target.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Create on an instance that already exists.
    #[error("{0} already exists")]
    AlreadyExists(Path),

    /// The object tree is in a state the device cannot reason about.
    #[error("inconsistent object tree: {reason}")]
    Inconsistent {
        /// What went wrong.
        reason: String,
    },
}

impl RequestError {
    /// Response code sent back to the requester.
    pub fn code(&self) -> ResponseCode {
        match self {
            Self::Protocol(_) | Self::ServerUnavailable { .. } | Self::AlreadyExists(_) => {
                ResponseCode::BadRequest
            },
            Self::NotFound(_) => ResponseCode::NotFound,
            Self::Unauthorized => ResponseCode::Unauthorized,
            Self::MethodNotAllowed => ResponseCode::MethodNotAllowed,
            Self::Inconsistent { .. } => ResponseCode::InternalServerError,
        }
    }

    /// Returns true if the requesting session must be torn down.
    ///
    /// Only tree inconsistencies are fatal, and only for the session that
    /// hit them; the device keeps serving everyone else.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Inconsistent { .. })
    }
}

/// Misuse of the device event API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Event references a server that is not provisioned.
    #[error("unknown server {ssid}")]
    UnknownServer {
        /// The SSID that was not found.
        ssid: Ssid,
    },

    /// A server with this SSID is already provisioned.
    #[error("server {ssid} already provisioned")]
    DuplicateServer {
        /// The duplicated SSID.
        ssid: Ssid,
    },

    /// SSID 65535 is reserved for bootstrap-owned entries.
    #[error("short server id {ssid} is reserved")]
    ReservedSsid {
        /// The rejected SSID.
        ssid: Ssid,
    },

    /// Event does not apply in the current state.
    #[error("unexpected event: {reason}")]
    UnexpectedEvent {
        /// Why it was rejected.
        reason: String,
    },

    /// Provisioning could not be applied to the object tree.
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] RequestError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(RequestError::NotFound(Path::for_object(7)).code(), ResponseCode::NotFound);
        assert_eq!(
            RequestError::ServerUnavailable { ssid: Ssid(1) }.code(),
            ResponseCode::BadRequest
        );
        assert_eq!(RequestError::Unauthorized.code(), ResponseCode::Unauthorized);
        assert_eq!(
            RequestError::Protocol(ProtocolError::TooManySegments { count: 5 }).code(),
            ResponseCode::BadRequest
        );
    }

    #[test]
    fn only_inconsistency_is_fatal() {
        assert!(RequestError::Inconsistent { reason: "x".into() }.is_fatal());
        assert!(!RequestError::Unauthorized.is_fatal());
        assert!(!RequestError::MethodNotAllowed.is_fatal());
    }

    #[test]
    fn display() {
        let err = RequestError::NotFound(Path::for_instance(1337, 3));
        assert_eq!(err.to_string(), "/1337/3 not found");
    }
}
