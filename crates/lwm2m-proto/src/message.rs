//! Request and response vocabulary shared by the core and its transports.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::path::Path;

/// Identity of the peer behind one secure-transport session.
///
/// Opaque: peers can be compared for equality and used as map keys, but have
/// no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{:016x}", self.0)
    }
}

/// Resumption handle for a secure-transport session.
///
/// Produced by the transport when a session is established and handed back
/// to it to resume that session without a full handshake.
///
/// # Security
///
/// The `Debug` impl redacts the ticket contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTicket(pub Bytes);

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionTicket(<redacted {} bytes>)", self.0.len())
    }
}

/// LwM2M enabler generation negotiated with the servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lwm2mVersion {
    /// LwM2M 1.0
    #[default]
    V1_0,
    /// LwM2M 1.1
    V1_1,
}

impl Lwm2mVersion {
    /// Version literal, `"1.0"` or `"1.1"`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }
}

impl fmt::Display for Lwm2mVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lwm2mVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Self::V1_0),
            "1.1" => Ok(Self::V1_1),
            other => Err(format!("unsupported LwM2M version: {other}")),
        }
    }
}

/// Operation requested by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Create an object instance.
    Create,
    /// Read a resource.
    Read,
    /// Write a resource or instance.
    Write,
    /// Execute an executable resource.
    Execute,
    /// Delete an instance.
    Delete,
    /// Discover the object tree.
    Discover,
    /// Observe a resource (answered like Read).
    Observe,
    /// Bootstrap-Finish from the bootstrap server.
    BootstrapFinish,
}

impl Method {
    /// True for methods that never modify the object tree.
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Read | Self::Discover | Self::Observe)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response code, stored as the CoAP `class << 5 | detail` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ResponseCode {
    /// 2.01
    Created = 0x41,
    /// 2.02
    Deleted = 0x42,
    /// 2.04
    Changed = 0x44,
    /// 2.05
    Content = 0x45,
    /// 4.00
    BadRequest = 0x80,
    /// 4.01
    Unauthorized = 0x81,
    /// 4.04
    NotFound = 0x84,
    /// 4.05
    MethodNotAllowed = 0x85,
    /// 5.00
    InternalServerError = 0xA0,
}

impl ResponseCode {
    /// True for 2.xx codes.
    pub const fn is_success(self) -> bool {
        (self as u8) >> 5 == 2
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = *self as u8;
        write!(f, "{}.{:02} {:?}", raw >> 5, raw & 0x1F, self)
    }
}

/// Content-Format of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum ContentFormat {
    /// `text/plain`
    PlainText = 0,
    /// `application/link-format`
    LinkFormat = 40,
    /// `application/octet-stream`
    OctetStream = 42,
}

/// Request body, already decoded by the external content codec.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Payload {
    /// No body.
    #[default]
    Empty,
    /// Single value (plain text or opaque bytes).
    Text(Bytes),
    /// Multiple resources of one instance, by resource id.
    Instance(Vec<(u16, Bytes)>),
    /// Several instances of one object, by instance id.
    Instances(Vec<(u16, Vec<(u16, Bytes)>)>),
}

impl Payload {
    /// Plain-text payload from a string slice.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Bytes::from(value.into()))
    }

    /// True for [`Payload::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Inbound request.
///
/// `path` is carried unparsed so that admission can run before any
/// protocol-level parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Session the request arrived on.
    pub peer: PeerId,
    /// Transport message id (used below the core for deduplication).
    pub message_id: u16,
    /// Requested operation.
    pub method: Method,
    /// Raw URI path text.
    pub path: String,
    /// Decoded body.
    pub payload: Payload,
}

impl Request {
    /// Request with an empty payload.
    pub fn new(peer: PeerId, method: Method, path: impl Into<String>) -> Self {
        Self { peer, message_id: 0, method, path: path.into(), payload: Payload::Empty }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the transport message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = message_id;
        self
    }
}

/// Outbound response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Result code.
    pub code: ResponseCode,
    /// Format of `payload`, absent for empty bodies.
    pub content_format: Option<ContentFormat>,
    /// Body.
    pub payload: Bytes,
    /// Location of a created instance.
    pub location: Option<Path>,
}

impl Response {
    /// Empty-bodied response with the given code.
    pub fn empty(code: ResponseCode) -> Self {
        Self { code, content_format: None, payload: Bytes::new(), location: None }
    }

    /// `Content` with a formatted body.
    pub fn content(format: ContentFormat, payload: impl Into<Bytes>) -> Self {
        Self {
            code: ResponseCode::Content,
            content_format: Some(format),
            payload: payload.into(),
            location: None,
        }
    }

    /// `Created` pointing at `location`.
    pub fn created(location: Path) -> Self {
        Self { location: Some(location), ..Self::empty(ResponseCode::Created) }
    }

    /// `Changed`.
    pub fn changed() -> Self {
        Self::empty(ResponseCode::Changed)
    }

    /// `Deleted`.
    pub fn deleted() -> Self {
        Self::empty(ResponseCode::Deleted)
    }
}
