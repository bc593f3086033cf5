//! Turmoil-backed datagram socket for the envelope transport.
//!
//! The runtime's [`EnvelopeTransport`] is generic over a [`DatagramSocket`];
//! plugging in [`SimSocket`] runs the production client unchanged inside a
//! turmoil host, with simulated latency, loss and partitions.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use lwm2m_client::{Client, ClientConfig, ClientError, DatagramSocket, EnvelopeTransport};
use lwm2m_core::Device;

use crate::sim_env::SimEnv;

/// Envelope transport over a simulated socket.
pub type SimTransport = EnvelopeTransport<SimSocket, SimEnv>;

/// Client runtime inside a turmoil host.
pub type SimClient = Client<SimTransport, SimEnv>;

/// UDP socket on the simulated network.
pub struct SimSocket(turmoil::net::UdpSocket);

impl SimSocket {
    /// Bind on the current turmoil host.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        turmoil::net::UdpSocket::bind(addr).await.map(Self)
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

#[async_trait]
impl DatagramSocket for SimSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    /// Literal addresses pass through; host names go through turmoil's
    /// registry and must name a host of the running simulation.
    async fn resolve(&self, authority: &str) -> io::Result<SocketAddr> {
        if let Ok(addr) = authority.parse() {
            return Ok(addr);
        }
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, authority.to_string());
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        Ok(SocketAddr::new(turmoil::lookup(host), port))
    }
}

/// Build the configured device, let `setup` add application objects, and
/// bind a client on the current turmoil host.
///
/// # Errors
///
/// Returns `Config` for an invalid configuration and `Transport` if the
/// simulated socket cannot be bound.
pub async fn bind_client(
    config: &ClientConfig,
    env: SimEnv,
    setup: impl FnOnce(&mut Device<SimEnv>),
) -> Result<SimClient, ClientError> {
    let mut device = config.build_device(env.clone())?;
    setup(&mut device);

    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|_| ClientError::Config(format!("invalid bind address {:?}", config.bind)))?;
    let socket = SimSocket::bind(addr).await?;
    tracing::debug!(addr = %socket.local_addr()?, "simulated client bound");

    let transport = EnvelopeTransport::new(socket, env.clone());
    Ok(Client::new(device, transport, env, config))
}
