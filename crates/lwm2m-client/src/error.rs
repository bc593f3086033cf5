//! Runtime error types.

use std::time::Duration;

use lwm2m_core::DeviceError;
use lwm2m_proto::{ProtocolError, ResponseCode};
use thiserror::Error;

/// Errors that can occur in the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error
    #[error("transport error: {0}")]
    Transport(String),

    /// An exchange did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// The bound that elapsed.
        after: Duration,
    },

    /// The server answered a registration exchange with an error code.
    #[error("server rejected {operation}: {code}")]
    Rejected {
        /// Exchange that was rejected.
        operation: &'static str,
        /// Code the server answered with.
        code: ResponseCode,
    },

    /// Wire encoding error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Device event API misuse
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl ClientError {
    /// Returns true if the session the error occurred on should be treated
    /// as lost.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::Config(_) | Self::Rejected { .. } | Self::Protocol(_) | Self::Device(_) => false,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use lwm2m_core::Ssid;

    use super::*;

    #[test]
    fn timeouts_lose_the_session() {
        let err = ClientError::Timeout { operation: "connect", after: Duration::from_secs(5) };
        assert!(err.is_session_fatal());
        assert_eq!(err.to_string(), "connect timed out after 5s");
    }

    #[test]
    fn rejection_keeps_the_session() {
        let err = ClientError::Rejected { operation: "register", code: ResponseCode::BadRequest };
        assert!(!err.is_session_fatal());
        assert_eq!(err.to_string(), "server rejected register: 4.00 BadRequest");
    }

    #[test]
    fn device_errors_convert() {
        let err: ClientError = DeviceError::UnknownServer { ssid: Ssid(3) }.into();
        assert_eq!(err.to_string(), "device error: unknown server 3");
    }

    #[test]
    fn io_errors_are_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        assert!(matches!(ClientError::from(io), ClientError::Transport(_)));
    }
}
