//! LwM2M protocol vocabulary.
//!
//! Pure data types shared by the sans-IO core, the runtime and the test
//! harness:
//!
//! - [`path`]: hierarchical resource addressing (0-4 integer segments)
//! - [`message`]: requests, responses, peers, codes and content formats
//! - [`wire`]: CBOR envelope for the development transport
//! - [`error`]: protocol-level errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod message;
pub mod path;
pub mod wire;

pub use error::ProtocolError;
pub use message::{
    ContentFormat, Lwm2mVersion, Method, Payload, PeerId, Request, Response, ResponseCode,
    SessionTicket,
};
pub use path::{MAX_SEGMENTS, Path, PathKind, Segment};
pub use wire::{Envelope, MAX_DATAGRAM_SIZE};
