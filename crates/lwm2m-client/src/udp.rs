//! NoSec development transport.
//!
//! Carries one CBOR [`Envelope`] per datagram over any [`DatagramSocket`].
//! A "session" is a remote address plus the ticket from its last
//! `HelloReply`; there is no key material, which makes this suitable for
//! development and simulation only.
//!
//! # Exchanges
//!
//! `connect`, `resume` and the registration calls send one envelope and
//! wait for the matching reply (`HelloReply` or `Ack`) from the same
//! address. Replies are routed to the waiter by the task running
//! [`SessionTransport::recv`], so that task must be running for any
//! exchange to complete. One exchange per address is outstanding at a time;
//! a newer one displaces the older, which then fails.
//!
//! Datagrams from addresses that never completed a handshake get a fresh
//! random [`PeerId`]; the device does not know that peer and ignores it,
//! and the runtime releases it again. Addresses pinned with
//! [`SessionTransport::bind_peer`] always map to the same identity.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use lwm2m_core::Environment;
use lwm2m_proto::{Envelope, MAX_DATAGRAM_SIZE, PeerId, Response, ResponseCode, SessionTicket};
use tokio::sync::{Mutex, oneshot};

use crate::{
    error::ClientError,
    transport::{DatagramSocket, Inbound, Registrar, Session, SessionTransport, authority},
};

#[derive(Default)]
struct Peers {
    addr_of: HashMap<PeerId, SocketAddr>,
    peer_at: HashMap<SocketAddr, PeerId>,
    pinned: HashMap<SocketAddr, PeerId>,
    waiters: HashMap<SocketAddr, oneshot::Sender<Envelope>>,
}

impl Peers {
    fn bind(&mut self, peer: PeerId, addr: SocketAddr) {
        if let Some(stale) = self.peer_at.insert(addr, peer).filter(|stale| *stale != peer) {
            self.addr_of.remove(&stale);
        }
        self.addr_of.insert(peer, addr);
    }

    fn unbind(&mut self, peer: PeerId) -> Option<SocketAddr> {
        let addr = self.addr_of.remove(&peer)?;
        self.peer_at.remove(&addr);
        self.waiters.remove(&addr);
        Some(addr)
    }

    /// Identity for a new session with `addr`.
    fn identity(&self, addr: SocketAddr, fresh: impl FnOnce() -> PeerId) -> PeerId {
        self.pinned.get(&addr).copied().unwrap_or_else(fresh)
    }
}

/// Envelope transport over a datagram socket.
pub struct EnvelopeTransport<S, E> {
    socket: S,
    env: E,
    peers: Mutex<Peers>,
}

impl<S: DatagramSocket, E: Environment> EnvelopeTransport<S, E> {
    /// Transport over `socket`, drawing peer ids from `env`.
    pub fn new(socket: S, env: E) -> Self {
        Self { socket, env, peers: Mutex::new(Peers::default()) }
    }

    /// Peers with a known address. Released strangers do not count.
    pub async fn session_count(&self) -> usize {
        self.peers.lock().await.addr_of.len()
    }

    async fn send_envelope(
        &self,
        addr: SocketAddr,
        envelope: &Envelope,
    ) -> Result<(), ClientError> {
        let bytes = envelope.encode()?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send `envelope` to `addr` and wait for the reply routed by `recv()`.
    async fn exchange(
        &self,
        addr: SocketAddr,
        envelope: &Envelope,
    ) -> Result<Envelope, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.peers.lock().await.waiters.insert(addr, tx);
        self.send_envelope(addr, envelope).await?;
        rx.await.map_err(|_| ClientError::Transport(format!("exchange with {addr} abandoned")))
    }

    async fn addr_of(&self, peer: PeerId) -> Result<SocketAddr, ClientError> {
        self.peers
            .lock()
            .await
            .addr_of
            .get(&peer)
            .copied()
            .ok_or_else(|| ClientError::Transport(format!("no session for {peer}")))
    }

    async fn acknowledged(
        &self,
        peer: PeerId,
        operation: &'static str,
        envelope: Envelope,
    ) -> Result<(), ClientError> {
        let addr = self.addr_of(peer).await?;
        match self.exchange(addr, &envelope).await? {
            Envelope::Ack { code } if code.is_success() => Ok(()),
            Envelope::Ack { code } => Err(ClientError::Rejected { operation, code }),
            other => Err(unexpected(operation, &other)),
        }
    }

    async fn peer_for(&self, addr: SocketAddr) -> PeerId {
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.peer_at.get(&addr) {
            return *peer;
        }
        let peer = peers.identity(addr, || PeerId(self.env.random_u64()));
        tracing::debug!(%addr, %peer, "datagram from unbound address");
        peers.bind(peer, addr);
        peer
    }
}

#[async_trait]
impl<S: DatagramSocket, E: Environment> SessionTransport for EnvelopeTransport<S, E> {
    async fn connect(&self, uri: &str) -> Result<Session, ClientError> {
        let addr = self.socket.resolve(&authority(uri)?).await?;
        match self.exchange(addr, &Envelope::Hello { ticket: None }).await? {
            Envelope::HelloReply { ticket, .. } => {
                let mut peers = self.peers.lock().await;
                let peer = peers.identity(addr, || PeerId(self.env.random_u64()));
                peers.bind(peer, addr);
                drop(peers);
                tracing::debug!(%addr, %peer, "session established");
                Ok(Session { peer, ticket: Some(ticket), resumed: false })
            },
            other => Err(unexpected("connect", &other)),
        }
    }

    async fn resume(&self, peer: PeerId, ticket: &SessionTicket) -> Result<Session, ClientError> {
        let addr = self.addr_of(peer).await?;
        let hello = Envelope::Hello { ticket: Some(ticket.clone()) };
        match self.exchange(addr, &hello).await? {
            Envelope::HelloReply { ticket, resumed } => {
                tracing::debug!(%addr, %peer, resumed, "session resumed");
                Ok(Session { peer, ticket: Some(ticket), resumed })
            },
            other => Err(unexpected("resume", &other)),
        }
    }

    async fn send(
        &self,
        peer: PeerId,
        message_id: u16,
        response: &Response,
    ) -> Result<(), ClientError> {
        let addr = self.addr_of(peer).await?;
        let envelope = Envelope::Response { message_id, response: response.clone() };
        self.send_envelope(addr, &envelope).await
    }

    async fn bind_peer(&self, uri: &str) -> Result<PeerId, ClientError> {
        let addr = self.socket.resolve(&authority(uri)?).await?;
        let mut peers = self.peers.lock().await;
        let peer = peers.identity(addr, || PeerId(self.env.random_u64()));
        peers.pinned.insert(addr, peer);
        peers.bind(peer, addr);
        tracing::debug!(%addr, %peer, "peer pinned");
        Ok(peer)
    }

    async fn close(&self, peer: PeerId) {
        let Some(addr) = self.peers.lock().await.unbind(peer) else {
            return;
        };
        let goodbye = Envelope::Goodbye { reason: "closed by client".to_string() };
        if let Err(err) = self.send_envelope(addr, &goodbye).await {
            tracing::debug!(%peer, %err, "goodbye not delivered");
        }
    }

    async fn release(&self, peer: PeerId) {
        if let Some(addr) = self.peers.lock().await.unbind(peer) {
            tracing::trace!(%addr, %peer, "peer released");
        }
    }

    async fn recv(&self) -> Result<Inbound, ClientError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            let envelope = match Envelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(%addr, %err, "undecodable datagram");
                    continue;
                },
            };

            match envelope {
                reply @ (Envelope::HelloReply { .. } | Envelope::Ack { .. }) => {
                    match self.peers.lock().await.waiters.remove(&addr) {
                        Some(waiter) => {
                            if waiter.send(reply).is_err() {
                                tracing::debug!(%addr, "exchange abandoned before its reply");
                            }
                        },
                        None => tracing::debug!(%addr, "reply without a pending exchange"),
                    }
                },
                request @ Envelope::Request { .. } => {
                    let peer = self.peer_for(addr).await;
                    if let Some(request) = request.into_request(peer) {
                        return Ok(Inbound::Request(request));
                    }
                },
                Envelope::Goodbye { reason } => {
                    let mut peers = self.peers.lock().await;
                    if let Some(peer) = peers.peer_at.get(&addr).copied() {
                        peers.unbind(peer);
                        tracing::debug!(%addr, %peer, %reason, "session closed by server");
                        return Ok(Inbound::Lost { peer });
                    }
                },
                other => tracing::debug!(%addr, ?other, "ignoring envelope"),
            }
        }
    }
}

#[async_trait]
impl<S: DatagramSocket, E: Environment> Registrar for EnvelopeTransport<S, E> {
    async fn register(
        &self,
        peer: PeerId,
        endpoint: &str,
        lifetime: Duration,
    ) -> Result<(), ClientError> {
        let lifetime = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);
        let envelope = Envelope::Register { endpoint: endpoint.to_string(), lifetime };
        self.acknowledged(peer, "register", envelope).await
    }

    async fn update(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError> {
        let envelope = Envelope::Update { endpoint: endpoint.to_string() };
        self.acknowledged(peer, "update", envelope).await
    }

    async fn deregister(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError> {
        let envelope = Envelope::Deregister { endpoint: endpoint.to_string() };
        self.acknowledged(peer, "deregister", envelope).await
    }

    async fn bootstrap_request(&self, peer: PeerId, endpoint: &str) -> Result<(), ClientError> {
        let envelope = Envelope::BootstrapRequest { endpoint: endpoint.to_string() };
        self.acknowledged(peer, "bootstrap request", envelope).await
    }
}

fn unexpected(operation: &'static str, envelope: &Envelope) -> ClientError {
    tracing::debug!(operation, ?envelope, "unexpected reply");
    ClientError::Rejected { operation, code: ResponseCode::BadRequest }
}
