//! Transport seams.
//!
//! The runtime talks to the network through two traits:
//!
//! - [`SessionTransport`]: secure-transport sessions (handshake, resumption,
//!   request/response traffic, teardown)
//! - [`Registrar`]: the registration interface exchanges, which ride on an
//!   established session
//!
//! The runtime drives `recv()` from one dedicated task and never cancels it,
//! so it need not be cancel-safe.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use lwm2m_proto::{PeerId, Request, Response, SessionTicket};

use crate::error::ClientError;

/// Default CoAP port, used when a server URI omits one.
pub const DEFAULT_PORT: u16 = 5683;

/// An established (or resumed) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session identity.
    pub peer: PeerId,
    /// Ticket for later resumption.
    pub ticket: Option<SessionTicket>,
    /// True if key material from an earlier session was reused.
    pub resumed: bool,
}

/// Something that arrived from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Server request, tagged with its session.
    Request(Request),
    /// The remote end tore the session down.
    Lost {
        /// Session that went away.
        peer: PeerId,
    },
}

/// Secure-transport sessions.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Full handshake with the server at `uri`.
    async fn connect(&self, uri: &str) -> Result<Session, ClientError>;

    /// Resume `peer` with `ticket`. The returned session keeps the same
    /// identity; `resumed` is false if the server fell back to a full
    /// handshake.
    async fn resume(&self, peer: PeerId, ticket: &SessionTicket) -> Result<Session, ClientError>;

    /// Send the response to request `message_id` on `peer`.
    async fn send(
        &self,
        peer: PeerId,
        message_id: u16,
        response: &Response,
    ) -> Result<(), ClientError>;

    /// Give traffic from `uri` one identity that outlives its sessions, so
    /// the server there can open a conversation the device recognises.
    /// Sessions later established with `uri` reuse the identity.
    async fn bind_peer(&self, uri: &str) -> Result<PeerId, ClientError>;

    /// Tear `peer` down. Closing an unknown session is a no-op.
    async fn close(&self, peer: PeerId);

    /// Forget `peer` without telling the remote end.
    async fn release(&self, peer: PeerId);

    /// Next inbound request or session loss.
    async fn recv(&self) -> Result<Inbound, ClientError>;
}

/// Registration interface.
///
/// Each call completes when the server acknowledged the exchange; a
/// non-success code is [`ClientError::Rejected`].
#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    /// Register `endpoint` with `lifetime`.
    async fn register(
        &self,
        peer: PeerId,
        endpoint: &str,
        lifetime: Duration,
    ) -> Result<(), ClientError>;

    /// Registration Update.
    async fn update(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError>;

    /// De-register.
    async fn deregister(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError>;

    /// Client-initiated Bootstrap-Request.
    async fn bootstrap_request(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError>;
}

/// Datagram socket under the envelope transport.
///
/// Implemented for [`tokio::net::UdpSocket`]; the simulation harness wraps
/// its own socket type.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Resolve a `host:port` authority.
    async fn resolve(&self, authority: &str) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        Self::send_to(self, buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Self::recv_from(self, buf).await
    }

    async fn resolve(&self, authority: &str) -> io::Result<SocketAddr> {
        tokio::net::lookup_host(authority).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {authority}"))
        })
    }
}

/// `host:port` part of a server URI such as `coap://host:5683`.
///
/// The scheme is optional; a missing port means [`DEFAULT_PORT`].
pub fn authority(uri: &str) -> Result<String, ClientError> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let host_port = rest.split(['/', '?']).next().unwrap_or_default();
    if host_port.is_empty() {
        return Err(ClientError::Config(format!("server URI {uri:?} has no host")));
    }

    let has_port = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            !host.ends_with(':') && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit())
        },
        None => false,
    };
    let bare_ipv6 = host_port.matches(':').count() > 1 && !host_port.starts_with('[');
    if bare_ipv6 {
        return Err(ClientError::Config(format!("IPv6 host in {uri:?} must be bracketed")));
    }

    if has_port { Ok(host_port.to_string()) } else { Ok(format!("{host_port}:{DEFAULT_PORT}")) }
}
