//! CBOR wire envelope.
//!
//! Development framing used by the bundled NoSec UDP transport and by the
//! simulation harness. One datagram carries exactly one [`Envelope`].
//!
//! # Session establishment
//!
//! ```text
//! device                              server
//!    |--- Hello { ticket: None } ------->|   full handshake
//!    |<-- HelloReply { ticket, false } --|
//!    |                                   |
//!    |--- Hello { ticket: Some(t) } ---->|   resumption
//!    |<-- HelloReply { t, true } --------|
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::ProtocolError,
    message::{Method, Payload, PeerId, Request, Response, ResponseCode, SessionTicket},
};

/// Upper bound on an encoded envelope.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Open or resume a session.
    Hello {
        /// Ticket to resume, `None` for a full handshake.
        ticket: Option<SessionTicket>,
    },

    /// Answer to [`Envelope::Hello`].
    HelloReply {
        /// Ticket for the (possibly resumed) session.
        ticket: SessionTicket,
        /// True if the previous key material was reused.
        resumed: bool,
    },

    /// Server to device operation.
    Request {
        /// Message id, echoed in the response.
        message_id: u16,
        /// Operation.
        method: Method,
        /// Raw URI path.
        path: String,
        /// Body.
        payload: Payload,
    },

    /// Device to server reply.
    Response {
        /// Id of the request being answered.
        message_id: u16,
        /// Outcome.
        response: Response,
    },

    /// Registration.
    Register {
        /// Endpoint client name.
        endpoint: String,
        /// Registration lifetime in seconds.
        lifetime: u32,
    },

    /// Registration update.
    Update {
        /// Endpoint client name.
        endpoint: String,
    },

    /// De-registration.
    Deregister {
        /// Endpoint client name.
        endpoint: String,
    },

    /// Client-initiated bootstrap.
    BootstrapRequest {
        /// Endpoint client name.
        endpoint: String,
    },

    /// Server's answer to Register, Update, Deregister or BootstrapRequest.
    Ack {
        /// Outcome.
        code: ResponseCode,
    },

    /// Session teardown.
    Goodbye {
        /// Reason, for logs.
        reason: String,
    },
}

impl Envelope {
    /// Wrap an outbound request.
    pub fn request(
        message_id: u16,
        method: Method,
        path: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::Request { message_id, method, path: path.into(), payload }
    }

    /// Convert a received request envelope into a core [`Request`] tagged
    /// with the session it arrived on.
    pub fn into_request(self, peer: PeerId) -> Option<Request> {
        match self {
            Self::Request { message_id, method, path, payload } => {
                Some(Request { peer, message_id, method, path, payload })
            },
            _ => None,
        }
    }

    /// Serialize to CBOR.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::Codec(format!(
                "envelope of {} bytes exceeds {MAX_DATAGRAM_SIZE}",
                buf.len()
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Deserialize from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            let len = bytes.len();
            return Err(ProtocolError::Codec(format!("datagram of {len} bytes too large")));
        }
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{message::ContentFormat, path::Path};

    #[test]
    fn request_survives_encoding_with_raw_path() {
        let envelope = Envelope::request(7, Method::Write, "/1337/01/1", Payload::text("42"));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        let request = decoded.into_request(PeerId(9)).unwrap();
        assert_eq!(request.peer, PeerId(9));
        assert_eq!(request.message_id, 7);
        assert_eq!(request.path, "/1337/01/1");
        assert_eq!(request.payload, Payload::text("42"));
    }

    #[test]
    fn response_with_location() {
        let mut response = Response::created(Path::parse("/1337/1").unwrap());
        response.content_format = Some(ContentFormat::PlainText);
        let envelope = Envelope::Response { message_id: 3, response: response.clone() };

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, Envelope::Response { message_id: 3, response });
    }

    #[test]
    fn non_request_envelope_is_not_a_request() {
        let envelope = Envelope::Goodbye { reason: "bye".to_string() };
        assert!(envelope.into_request(PeerId(1)).is_none());
    }

    #[test]
    fn registration_ack_carries_code() {
        let envelope = Envelope::Ack { code: ResponseCode::Created };
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, Envelope::Ack { code: ResponseCode::Created });
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(Envelope::decode(&[0xff, 0x00, 0x13]), Err(ProtocolError::Codec(_))));
    }

    #[test]
    fn oversized_datagram_rejected() {
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(Envelope::decode(&big).is_err());
    }
}
