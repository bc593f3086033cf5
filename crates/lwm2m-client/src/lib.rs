//! LwM2M client runtime.
//!
//! Drives the sans-IO [`lwm2m_core::Device`] with:
//! - Tokio for tasks, timers and locks
//! - A CBOR-over-UDP development transport ([`EnvelopeTransport`])
//! - System time and OS randomness ([`SystemEnv`])
//!
//! ## Architecture
//!
//! ```text
//! lwm2m-client
//!   ├─ Client               (event loop, per-peer workers, timer)
//!   ├─ RetransmissionCache  (replays responses to retransmitted requests)
//!   ├─ SessionTransport     (handshake, resumption, request traffic)
//!   ├─ Registrar            (Register / Update / De-register / Bootstrap-Request)
//!   ├─ EnvelopeTransport    (both traits over any DatagramSocket)
//!   └─ SystemEnv            (production Environment impl)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dedup;
mod error;
mod runtime;
mod system_env;
pub mod transport;
mod udp;

pub use config::{ClientConfig, ServerConfig};
pub use dedup::{DEFAULT_CAPACITY, RetransmissionCache};
pub use error::ClientError;
pub use runtime::{Client, SharedDevice};
pub use system_env::SystemEnv;
pub use transport::{DatagramSocket, Inbound, Registrar, Session, SessionTransport};
pub use udp::EnvelopeTransport;

/// Production client over a tokio UDP socket.
pub type UdpClient = Client<EnvelopeTransport<tokio::net::UdpSocket, SystemEnv>, SystemEnv>;

/// Bind the configured UDP socket and assemble a production client.
///
/// # Errors
///
/// Returns `Config` for an invalid configuration and `Transport` if the
/// socket cannot be bound.
pub async fn bind(config: &ClientConfig) -> Result<UdpClient, ClientError> {
    let env = SystemEnv::new();
    let device = config.build_device(env)?;

    let socket = tokio::net::UdpSocket::bind(&config.bind).await?;
    tracing::info!("bound to {}", socket.local_addr()?);

    let transport = EnvelopeTransport::new(socket, env);
    Ok(Client::new(device, transport, env, config))
}
