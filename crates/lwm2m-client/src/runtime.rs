//! Tokio runtime around the sans-IO device.
//!
//! # Tasks
//!
//! ```text
//! receiver ──Request──> per-peer worker ──> device (read lock, else write lock)
//!          └─Lost─────> event loop
//! timer ────Tick──────> event loop ──> device (write lock)
//! spawned exchanges ──> event loop      (connect, register, resume, ...)
//! ```
//!
//! Every path ends in `Shared::execute`, which runs the returned actions
//! in order. Actions that wait on the network are spawned and report back
//! through the event channel, so the device lock is never held across a
//! network exchange.
//!
//! # Peers
//!
//! A configured Bootstrap Server is pinned to one peer id before the device
//! starts and keeps its bootstrap role across sessions, so it may start a
//! bootstrap on its own. Any other peer the device has no role for is
//! released after its request is dropped.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use lwm2m_core::{Device, DeviceAction, DeviceEvent, Environment, LogLevel, PeerRole, Ssid};
use lwm2m_proto::{PeerId, Request, SessionTicket};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

use crate::{
    config::ClientConfig,
    dedup::RetransmissionCache,
    error::ClientError,
    transport::{Inbound, Registrar, SessionTransport},
};

/// Requests queued per peer before new ones are dropped.
const PEER_QUEUE_DEPTH: usize = 32;

/// Events queued for the event loop.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Shared handle to the device driven by a [`Client`].
pub type SharedDevice<E> = Arc<RwLock<Device<E>>>;

/// State shared by every runtime task.
struct Shared<T, E: Environment> {
    device: SharedDevice<E>,
    transport: Arc<T>,
    env: E,
    endpoint: String,
    connect_timeout: Duration,
    bootstrap_server: Option<String>,
    bootstrap_peer: OnceLock<PeerId>,
    dedup: Mutex<RetransmissionCache>,
    workers: Mutex<HashMap<PeerId, mpsc::Sender<Request>>>,
    events: mpsc::Sender<DeviceEvent>,
    timer: Notify,
}

/// The LwM2M client runtime.
///
/// Owns the device and drives it from the network, the clock and its own
/// registration exchanges until the transport fails for good.
pub struct Client<T, E: Environment> {
    shared: Arc<Shared<T, E>>,
    events: mpsc::Receiver<DeviceEvent>,
}

impl<T, E> Client<T, E>
where
    T: SessionTransport + Registrar,
    E: Environment,
{
    /// Runtime for `device`, talking through `transport`.
    pub fn new(device: Device<E>, transport: T, env: E, config: &ClientConfig) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let shared = Shared {
            device: Arc::new(RwLock::new(device)),
            transport: Arc::new(transport),
            env,
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout,
            bootstrap_server: config.bootstrap_server.clone(),
            bootstrap_peer: OnceLock::new(),
            dedup: Mutex::new(RetransmissionCache::default()),
            workers: Mutex::new(HashMap::new()),
            events: events_tx,
            timer: Notify::new(),
        };
        Self { shared: Arc::new(shared), events }
    }

    /// Handle to the device, for inspection while the client runs.
    pub fn device(&self) -> SharedDevice<E> {
        Arc::clone(&self.shared.device)
    }

    /// Handle to the transport.
    pub fn transport(&self) -> Arc<T> {
        Arc::clone(&self.shared.transport)
    }

    /// Start the device and serve until the transport's receive side fails.
    ///
    /// # Errors
    ///
    /// Returns the transport error that stopped the receiver.
    pub async fn run(self) -> Result<(), ClientError> {
        let Self { shared, mut events } = self;

        shared.pin_bootstrap_server().await;
        let actions = shared.device.write().await.start();
        shared.execute(actions).await;

        let timer = tokio::spawn(Arc::clone(&shared).run_timer());
        let mut receiver = tokio::spawn(Arc::clone(&shared).run_receiver());

        let result = loop {
            tokio::select! {
                Some(event) = events.recv() => shared.process_event(event).await,
                joined = &mut receiver => {
                    break joined.unwrap_or_else(|err| {
                        Err(ClientError::Transport(format!("receiver task failed: {err}")))
                    });
                },
            }
        };

        timer.abort();
        result
    }
}

impl<T, E> Shared<T, E>
where
    T: SessionTransport + Registrar,
    E: Environment,
{
    async fn run_receiver(self: Arc<Self>) -> Result<(), ClientError> {
        loop {
            match self.transport.recv().await {
                Ok(Inbound::Request(request)) => self.dispatch(request).await,
                Ok(Inbound::Lost { peer }) => {
                    self.forget(peer).await;
                    self.post(DeviceEvent::SessionLost { peer }).await;
                    if self.is_bootstrap_server(peer) {
                        self.post(bootstrap_established(peer)).await;
                    }
                },
                Err(err) if err.is_session_fatal() => return Err(err),
                Err(err) => tracing::warn!(%err, "receive error"),
            }
        }
    }

    /// Queue `request` on its peer's worker, spawning the worker on first
    /// contact.
    async fn dispatch(self: &Arc<Self>, request: Request) {
        let peer = request.peer;
        let mut workers = self.workers.lock().await;
        let queue = workers.entry(peer).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
            tokio::spawn(Arc::clone(self).run_worker(rx));
            tx
        });

        if let Err(err) = queue.try_send(request) {
            // A full queue sheds load; the server retransmits.
            tracing::warn!(%peer, "request queue full, dropping: {err}");
        }
    }

    async fn run_worker(self: Arc<Self>, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.recv().await {
            self.process_request(request).await;
        }
    }

    async fn process_request(self: &Arc<Self>, request: Request) {
        let (peer, message_id) = (request.peer, request.message_id);

        let cached = self.dedup.lock().await.get(peer, message_id).cloned();
        if let Some(response) = cached {
            tracing::debug!(%peer, message_id, "replaying response to retransmission");
            if let Err(err) = self.transport.send(peer, message_id, &response).await {
                tracing::warn!(%peer, %err, "replay failed");
            }
            return;
        }

        let shared = self.device.read().await.try_handle_shared(&request);
        let actions = match shared {
            Some(actions) => actions,
            None => {
                let result = self.device.write().await.handle(DeviceEvent::Request(request));
                result.unwrap_or_else(|err| {
                    tracing::error!(%peer, %err, "request failed");
                    Vec::new()
                })
            },
        };
        self.execute(actions).await;

        if self.device.read().await.role_of(peer).is_none() && !self.is_bootstrap_server(peer) {
            tracing::debug!(%peer, "releasing unknown peer");
            self.transport.release(peer).await;
            self.forget(peer).await;
        }
    }

    async fn process_event(self: &Arc<Self>, event: DeviceEvent) {
        let result = self.device.write().await.handle(event);
        match result {
            Ok(actions) => self.execute(actions).await,
            Err(err) => {
                tracing::warn!(%err, "event rejected by device");
                self.timer.notify_one();
            },
        }
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = self.device.read().await.next_deadline();
            let Some(deadline) = deadline else {
                self.timer.notified().await;
                continue;
            };

            let wait = deadline.saturating_duration_since(self.env.now());
            tokio::select! {
                () = self.env.sleep(wait) => {
                    self.post(DeviceEvent::Tick { now: self.env.now() }).await;
                    // Wait for the tick to be processed before re-reading.
                    self.timer.notified().await;
                },
                () = self.timer.notified() => {},
            }
        }
    }

    async fn post(&self, event: DeviceEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event loop gone");
        }
    }

    /// Pin the configured Bootstrap Server and give it its role.
    async fn pin_bootstrap_server(&self) {
        let Some(uri) = self.bootstrap_server.as_deref() else {
            return;
        };
        match self.bounded("resolve", self.transport.bind_peer(uri)).await {
            Ok(peer) => {
                if self.bootstrap_peer.set(peer).is_err() {
                    tracing::debug!(%peer, "bootstrap server already pinned");
                }
                self.reinstate_bootstrap_server(peer).await;
            },
            Err(err) => tracing::error!(%uri, %err, "cannot pin the bootstrap server"),
        }
    }

    fn is_bootstrap_server(&self, peer: PeerId) -> bool {
        self.bootstrap_peer.get() == Some(&peer)
    }

    async fn reinstate_bootstrap_server(&self, peer: PeerId) {
        match self.device.write().await.handle(bootstrap_established(peer)) {
            Ok(_) => tracing::debug!(%peer, "bootstrap server may start a bootstrap"),
            Err(err) => tracing::warn!(%peer, %err, "bootstrap server not reinstated"),
        }
    }

    async fn forget(&self, peer: PeerId) {
        self.workers.lock().await.remove(&peer);
        self.dedup.lock().await.forget_peer(peer);
    }

    /// Run `exchange` under the connect timeout.
    async fn bounded<R>(
        &self,
        operation: &'static str,
        exchange: impl Future<Output = Result<R, ClientError>>,
    ) -> Result<R, ClientError> {
        let after = self.connect_timeout;
        tokio::time::timeout(after, exchange)
            .await
            .map_err(|_| ClientError::Timeout { operation, after })?
    }

    /// Execute device actions in order.
    async fn execute(self: &Arc<Self>, actions: Vec<DeviceAction>) {
        for action in actions {
            match action {
                DeviceAction::Respond { peer, message_id, response } => {
                    self.dedup.lock().await.insert(peer, message_id, response.clone());
                    if let Err(err) = self.transport.send(peer, message_id, &response).await {
                        tracing::warn!(%peer, %err, "response not sent");
                    }
                },

                DeviceAction::Register { ssid, uri, lifetime } => {
                    tokio::spawn(Arc::clone(self).register(ssid, uri, lifetime));
                },

                DeviceAction::Update { ssid } => {
                    tokio::spawn(Arc::clone(self).update(ssid));
                },

                DeviceAction::Deregister { ssid, peer } => {
                    let exchange = self.transport.deregister(peer, &self.endpoint);
                    match self.bounded("deregister", exchange).await {
                        Ok(()) => tracing::info!(%ssid, "de-registered"),
                        Err(err) => tracing::warn!(%ssid, %err, "de-registration failed"),
                    }
                },

                DeviceAction::SendBootstrapRequest { peer } => {
                    tokio::spawn(Arc::clone(self).bootstrap_request(peer));
                },

                DeviceAction::ConnectBootstrapServer { uri } => {
                    tokio::spawn(Arc::clone(self).connect_bootstrap_server(uri));
                },

                DeviceAction::SuspendSession { ssid, peer } => {
                    tracing::debug!(%ssid, %peer, "session suspended");
                },

                DeviceAction::ResumeSession { ssid, peer, ticket } => {
                    tokio::spawn(Arc::clone(self).resume(ssid, peer, ticket));
                },

                DeviceAction::CloseSession { peer } => {
                    self.transport.close(peer).await;
                    self.forget(peer).await;
                    if self.is_bootstrap_server(peer) {
                        self.reinstate_bootstrap_server(peer).await;
                    }
                },

                DeviceAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{}", message),
                    LogLevel::Info => tracing::info!("{}", message),
                    LogLevel::Warn => tracing::warn!("{}", message),
                    LogLevel::Error => tracing::error!("{}", message),
                },
            }
        }

        self.timer.notify_one();
    }

    async fn register(self: Arc<Self>, ssid: Ssid, uri: String, lifetime: Duration) {
        let existing = self.device.read().await.servers().get(ssid).and_then(|entry| entry.peer);
        let peer = match existing {
            Some(peer) => peer,
            None => match self.bounded("connect", self.transport.connect(&uri)).await {
                Ok(session) => {
                    let role = PeerRole::Server(ssid);
                    let (peer, ticket) = (session.peer, session.ticket);
                    self.post(DeviceEvent::SessionEstablished { peer, role, ticket }).await;
                    peer
                },
                Err(err) => {
                    let reason = format!("connect to {uri}: {err}");
                    self.post(DeviceEvent::RegistrationFailed { ssid, reason }).await;
                    return;
                },
            },
        };

        let exchange = self.transport.register(peer, &self.endpoint, lifetime);
        let event = match self.bounded("register", exchange).await {
            Ok(()) => DeviceEvent::RegistrationCompleted { ssid },
            Err(err) => DeviceEvent::RegistrationFailed { ssid, reason: err.to_string() },
        };
        self.post(event).await;
    }

    async fn update(self: Arc<Self>, ssid: Ssid) {
        let peer = self.device.read().await.servers().get(ssid).and_then(|entry| entry.peer);
        let result = match peer {
            Some(peer) => self.bounded("update", self.transport.update(peer, &self.endpoint)).await,
            None => Err(ClientError::Transport(format!("server {ssid} has no session"))),
        };

        let event = match result {
            Ok(()) => DeviceEvent::RegistrationCompleted { ssid },
            Err(err) => DeviceEvent::RegistrationFailed { ssid, reason: err.to_string() },
        };
        self.post(event).await;
    }

    async fn bootstrap_request(self: Arc<Self>, peer: PeerId) {
        let exchange = self.transport.bootstrap_request(peer, &self.endpoint);
        match self.bounded("bootstrap request", exchange).await {
            Ok(()) => tracing::info!(%peer, "bootstrap requested"),
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(%peer, %err, "bootstrap request failed");
                self.post(DeviceEvent::SessionLost { peer }).await;
            },
            // The bootstrap timeout concludes the attempt.
            Err(err) => tracing::warn!(%peer, %err, "bootstrap request rejected"),
        }
    }

    async fn connect_bootstrap_server(self: Arc<Self>, uri: String) {
        match self.bounded("connect", self.transport.connect(&uri)).await {
            Ok(session) => {
                let peer = session.peer;
                let role = PeerRole::Bootstrap;
                self.post(DeviceEvent::SessionEstablished { peer, role, ticket: session.ticket })
                    .await;
                self.post(DeviceEvent::BootstrapRequested { peer }).await;
            },
            Err(err) => tracing::error!(%uri, %err, "cannot reach the bootstrap server"),
        }
    }

    async fn resume(self: Arc<Self>, ssid: Ssid, peer: PeerId, ticket: SessionTicket) {
        match self.bounded("resume", self.transport.resume(peer, &ticket)).await {
            Ok(session) => {
                let event = DeviceEvent::SessionResumed {
                    ssid,
                    peer: session.peer,
                    ticket: session.ticket,
                    resumed: session.resumed,
                };
                self.post(event).await;
            },
            Err(err) => {
                tracing::warn!(%ssid, %peer, %err, "session resumption failed");
                self.post(DeviceEvent::SessionLost { peer }).await;
            },
        }
    }
}

fn bootstrap_established(peer: PeerId) -> DeviceEvent {
    DeviceEvent::SessionEstablished { peer, role: PeerRole::Bootstrap, ticket: None }
}
