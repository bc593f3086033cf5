//! Operations for model-based testing.
//!
//! Operations represent everything that can happen to a device with one
//! regular server, one bootstrap server and a handful of strangers. They
//! are generated randomly by proptest and applied to both the model and the
//! real device.

use arbitrary::Arbitrary;
use lwm2m_proto::{PeerId, ResponseCode};

/// Who sends a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum PeerSlot {
    /// The Bootstrap Server's session.
    Bootstrap,
    /// The session of the single regular server.
    Server,
    /// A session the device never established.
    Stranger(u8),
}

impl PeerSlot {
    /// Session id used for this slot on the real device.
    pub fn peer_id(self) -> PeerId {
        match self {
            Self::Bootstrap => PeerId(0xB5),
            Self::Server => PeerId(1),
            Self::Stranger(n) => PeerId(0x1000 + u64::from(n)),
        }
    }
}

/// Request against the single application resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum RequestKind {
    /// Read the resource.
    Read,
    /// Write the resource; the value is sent as its decimal text.
    Write(u8),
    /// Bootstrap-Finish on `/`.
    Finish,
}

/// Operations that can be applied to the system.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// A request arrives.
    Request {
        /// Sending session.
        from: PeerSlot,
        /// What it asks for.
        kind: RequestKind,
    },

    /// The Bootstrap Server's session comes (back) up.
    ConnectBootstrap,

    /// Advance time and deliver a tick.
    AdvanceTime {
        /// Seconds to advance.
        secs: u16,
    },
}

/// Result of applying an operation.
///
/// Used to compare model and real system behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Not a request; nothing to compare.
    Ok,

    /// The request was discarded without any response.
    Dropped,

    /// The request was answered.
    Answered {
        /// Response code.
        code: ResponseCode,
        /// Body of a `Content` response.
        body: Option<String>,
    },
}

impl OperationResult {
    /// Answer without a body.
    pub fn code(code: ResponseCode) -> Self {
        Self::Answered { code, body: None }
    }

    /// `Content` answer carrying `body`.
    pub fn content(body: impl Into<String>) -> Self {
        Self::Answered { code: ResponseCode::Content, body: Some(body.into()) }
    }

    /// True if the request got no response at all.
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}
