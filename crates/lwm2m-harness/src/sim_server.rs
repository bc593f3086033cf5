//! Scripted LwM2M server for simulation.
//!
//! Speaks the envelope protocol from a turmoil host. Handshakes and
//! registration exchanges are answered automatically; everything the device
//! sends is surfaced as an [`Observed`] value so tests can assert on the
//! exact sequence.
//!
//! The server talks to one device: the address of the last datagram it
//! received, or the one it was pointed at with [`SimServer::target`].

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Bytes;
use lwm2m_core::Environment;
use lwm2m_proto::{
    Envelope, MAX_DATAGRAM_SIZE, Method, Payload, Response, ResponseCode, SessionTicket,
};
use turmoil::net::UdpSocket;

use crate::sim_env::SimEnv;

/// Something the device sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// Handshake; `resumed` is what the server answered.
    Hello {
        /// True if the presented ticket was one this server issued.
        resumed: bool,
    },
    /// Registration.
    Register {
        /// Endpoint client name.
        endpoint: String,
        /// Lifetime in seconds.
        lifetime: u32,
    },
    /// Registration Update.
    Update,
    /// De-registration.
    Deregister,
    /// Client-initiated bootstrap.
    BootstrapRequest {
        /// Endpoint client name.
        endpoint: String,
    },
    /// Answer to one of our requests.
    Response {
        /// Id of the request.
        message_id: u16,
        /// The answer.
        response: Response,
    },
    /// Session teardown.
    Goodbye,
}

/// Scripted server.
pub struct SimServer {
    socket: UdpSocket,
    env: SimEnv,
    device: Option<SocketAddr>,
    tickets: Vec<SessionTicket>,
    backlog: VecDeque<Observed>,
    next_message_id: u16,
    rejection: Option<ResponseCode>,
}

impl SimServer {
    /// Bind `port` on the current turmoil host.
    pub async fn bind(port: u16, env: SimEnv) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        Ok(Self {
            socket,
            env,
            device: None,
            tickets: Vec::new(),
            backlog: VecDeque::new(),
            next_message_id: 1,
            rejection: None,
        })
    }

    /// Answer the next Register or Update with `code` instead of success.
    pub fn reject_next_registration(&mut self, code: ResponseCode) {
        self.rejection = Some(code);
    }

    /// Talk to `device` before it has sent anything, e.g. to start a
    /// bootstrap from the server side.
    pub fn target(&mut self, device: SocketAddr) {
        self.device = Some(device);
    }

    /// Address of the device, once it has sent anything.
    pub fn device(&self) -> Option<SocketAddr> {
        self.device
    }

    /// Next thing the device sent.
    pub async fn next(&mut self) -> io::Result<Observed> {
        match self.backlog.pop_front() {
            Some(observed) => Ok(observed),
            None => self.receive().await,
        }
    }

    /// Like [`SimServer::next`], but `None` if the device stays silent for
    /// `bound`.
    pub async fn next_within(&mut self, bound: Duration) -> io::Result<Option<Observed>> {
        match tokio::time::timeout(bound, self.next()).await {
            Ok(observed) => observed.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a request with a fresh message id and return the id.
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> io::Result<u16> {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.send_request(message_id, method, path, payload).await?;
        Ok(message_id)
    }

    /// Send a request with an explicit message id, e.g. a retransmission.
    pub async fn send_request(
        &self,
        message_id: u16,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> io::Result<()> {
        self.send(&Envelope::request(message_id, method, path, payload)).await
    }

    /// Wait for the response to `message_id`. Anything else that arrives
    /// meanwhile stays queued for [`SimServer::next`].
    pub async fn response(&mut self, message_id: u16) -> io::Result<Response> {
        let queued = self.backlog.iter().position(|observed| {
            matches!(observed, Observed::Response { message_id: id, .. } if *id == message_id)
        });
        if let Some(Observed::Response { response, .. }) =
            queued.and_then(|index| self.backlog.remove(index))
        {
            return Ok(response);
        }

        loop {
            match self.receive().await? {
                Observed::Response { message_id: id, response } if id == message_id => {
                    return Ok(response);
                },
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Request and wait for its response.
    pub async fn exchange(
        &mut self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> io::Result<Response> {
        let message_id = self.request(method, path, payload).await?;
        self.response(message_id).await
    }

    /// Tear the session down from the server side.
    pub async fn goodbye(&self) -> io::Result<()> {
        self.send(&Envelope::Goodbye { reason: "closed by server".to_string() }).await
    }

    async fn receive(&mut self) -> io::Result<Observed> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let envelope = match Envelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(%from, %err, "undecodable datagram");
                    continue;
                },
            };
            self.device = Some(from);

            let observed = match envelope {
                Envelope::Hello { ticket } => {
                    let known = ticket.filter(|ticket| self.tickets.contains(ticket));
                    let resumed = known.is_some();
                    let ticket = match known {
                        Some(ticket) => ticket,
                        None => self.issue_ticket(),
                    };
                    self.send(&Envelope::HelloReply { ticket, resumed }).await?;
                    Observed::Hello { resumed }
                },
                Envelope::Register { endpoint, lifetime } => {
                    let code = self.rejection.take().unwrap_or(ResponseCode::Created);
                    self.ack(code).await?;
                    Observed::Register { endpoint, lifetime }
                },
                Envelope::Update { .. } => {
                    let code = self.rejection.take().unwrap_or(ResponseCode::Changed);
                    self.ack(code).await?;
                    Observed::Update
                },
                Envelope::Deregister { .. } => {
                    self.ack(ResponseCode::Deleted).await?;
                    Observed::Deregister
                },
                Envelope::BootstrapRequest { endpoint } => {
                    self.ack(ResponseCode::Changed).await?;
                    Observed::BootstrapRequest { endpoint }
                },
                Envelope::Response { message_id, response } => {
                    Observed::Response { message_id, response }
                },
                Envelope::Goodbye { .. } => Observed::Goodbye,
                other => {
                    tracing::debug!(%from, ?other, "ignoring envelope");
                    continue;
                },
            };
            return Ok(observed);
        }
    }

    fn issue_ticket(&mut self) -> SessionTicket {
        let mut bytes = [0u8; 16];
        self.env.random_bytes(&mut bytes);
        let ticket = SessionTicket(Bytes::copy_from_slice(&bytes));
        self.tickets.push(ticket.clone());
        ticket
    }

    async fn ack(&self, code: ResponseCode) -> io::Result<()> {
        self.send(&Envelope::Ack { code }).await
    }

    async fn send(&self, envelope: &Envelope) -> io::Result<()> {
        let device = self
            .device
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no device yet"))?;
        let bytes = envelope
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        self.socket.send_to(&bytes, device).await?;
        Ok(())
    }
}
