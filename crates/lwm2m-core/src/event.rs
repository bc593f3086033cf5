//! Device events and actions.
//!
//! The device consumes [`DeviceEvent`]s and returns [`DeviceAction`]s. It
//! never performs I/O itself; the runtime executes the actions in order.

use std::time::{Duration, Instant};

use lwm2m_proto::{PeerId, Request, Response, SessionTicket};

use crate::registry::Ssid;

/// What a transport session is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// The LwM2M Bootstrap Server.
    Bootstrap,
    /// A regular LwM2M Server.
    Server(Ssid),
}

/// Input to the device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Inbound request from a server.
    Request(Request),

    /// A transport session came up (full handshake).
    SessionEstablished {
        /// Session identity.
        peer: PeerId,
        /// Who is on the other end.
        role: PeerRole,
        /// Ticket for later resumption.
        ticket: Option<SessionTicket>,
    },

    /// A session suspended during bootstrap is back.
    SessionResumed {
        /// Server the session belongs to.
        ssid: Ssid,
        /// Session identity (unchanged across resumption).
        peer: PeerId,
        /// Fresh ticket, if the transport issued one.
        ticket: Option<SessionTicket>,
        /// False if the transport fell back to a full handshake.
        resumed: bool,
    },

    /// A session went down.
    SessionLost {
        /// Session identity.
        peer: PeerId,
    },

    /// Client-initiated bootstrap over a session to the Bootstrap Server.
    BootstrapRequested {
        /// Session to the Bootstrap Server.
        peer: PeerId,
    },

    /// Register (or Update) for `ssid` succeeded.
    RegistrationCompleted {
        /// Server that accepted the registration.
        ssid: Ssid,
    },

    /// Register for `ssid` failed.
    RegistrationFailed {
        /// Server that rejected or did not answer.
        ssid: Ssid,
        /// Failure description, for logs.
        reason: String,
    },

    /// Time passed.
    Tick {
        /// Current time.
        now: Instant,
    },
}

/// Log severity for [`DeviceAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

/// Output of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    /// Answer a request.
    Respond {
        /// Requesting session.
        peer: PeerId,
        /// Id of the request being answered.
        message_id: u16,
        /// The answer.
        response: Response,
    },

    /// Connect (if needed) and Register with a server.
    Register {
        /// Server to register with.
        ssid: Ssid,
        /// Server URI.
        uri: String,
        /// Registration lifetime.
        lifetime: Duration,
    },

    /// Send a registration Update.
    Update {
        /// Server to update.
        ssid: Ssid,
    },

    /// Send a De-register on the server's session. Always precedes the
    /// `CloseSession` for the same peer.
    Deregister {
        /// Server to de-register from.
        ssid: Ssid,
        /// Its session.
        peer: PeerId,
    },

    /// Send a Bootstrap-Request on `peer`.
    SendBootstrapRequest {
        /// Session to the Bootstrap Server.
        peer: PeerId,
    },

    /// Open a session to the Bootstrap Server and request bootstrap.
    ConnectBootstrapServer {
        /// Bootstrap Server URI.
        uri: String,
    },

    /// Park a server session while bootstrapping; stop polling it.
    SuspendSession {
        /// Server being parked.
        ssid: Ssid,
        /// Its session.
        peer: PeerId,
    },

    /// Bring a parked session back using its resumption ticket.
    ResumeSession {
        /// Server being resumed.
        ssid: Ssid,
        /// Session identity to preserve.
        peer: PeerId,
        /// Ticket from the original handshake.
        ticket: SessionTicket,
    },

    /// Tear a session down.
    CloseSession {
        /// Session to close.
        peer: PeerId,
    },

    /// Log a message.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message.
        message: String,
    },
}

impl DeviceAction {
    pub(crate) fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log { level, message: message.into() }
    }
}
