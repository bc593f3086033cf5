//! Device state machine.
//!
//! The `Device` owns the object tree, the Access Control Gate, the Server
//! Registration Entries and the Bootstrap session, and is the only place
//! where they change. It is sans-IO: [`Device::handle`] takes a
//! [`DeviceEvent`] and returns the [`DeviceAction`]s the runtime must
//! execute, in order.
//!
//! ## Request pipeline
//!
//! 1. Admission on the raw request (peer identity only). Dropped traffic
//!    produces no action at all, not even a log action.
//! 2. Path parsing. Failures answer Bad-Request.
//! 3. Authorization (operational mode only).
//! 4. The operation against the tree, then re-synchronisation of the
//!    registry and the gate if the tree changed.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use lwm2m_proto::{
    ContentFormat, Lwm2mVersion, Method, Path, PathKind, Payload, PeerId, ProtocolError, Request,
    Response, SessionTicket,
};
use serde::Deserialize;

use crate::{
    access::{AccessControl, AccessEntry, AccessTarget},
    bootstrap::{Admission, BootstrapSession, BootstrapState},
    discover::{DiscoverBuilder, DiscoverMode},
    dm::{Instance, MAX_INSTANCE_ID, ObjectTree, Resource, oid, resource_ids, security, server},
    env::Environment,
    error::{DeviceError, RequestError},
    event::{DeviceAction, DeviceEvent, LogLevel, PeerRole},
    registry::{
        EntryDefaults, ServerEntry, ServerRegistry, ServerState, Ssid, bootstrap_uri,
        is_bootstrap_security,
    },
};

/// Shortest interval between lifetime-driven Updates.
const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Longest timer the device arms. Servers write Lifetime and Disable
/// Timeout; anything longer saturates here.
const MAX_TIMER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Security Mode resource value for NoSec.
const SECURITY_MODE_NOSEC: &str = "3";

/// Handler behind an executable resource.
///
/// Receives the resources of the instance it was executed on, mutably, and
/// the Execute arguments.
pub type ExecuteHandler =
    Arc<dyn Fn(&mut Instance, &[u8]) -> Result<(), RequestError> + Send + Sync>;

/// Device configuration.
///
/// Deserializes with every field optional; durations use serde's
/// `{ secs, nanos }` form.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// LwM2M generation spoken to servers.
    pub version: Lwm2mVersion,
    /// Bootstrap inactivity timeout (CoAP EXCHANGE_LIFETIME).
    pub bootstrap_timeout: Duration,
    /// Lifetime for Server instances without resource 1.
    pub default_lifetime: Duration,
    /// Disable Timeout for Server instances without resource 5.
    pub default_disable_timeout: Duration,
    /// Delay before retrying a failed registration.
    pub registration_retry: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            version: Lwm2mVersion::V1_0,
            bootstrap_timeout: Duration::from_secs(247),
            default_lifetime: Duration::from_secs(86400),
            default_disable_timeout: Duration::from_secs(86400),
            registration_retry: Duration::from_secs(30),
        }
    }
}

/// A regular server to provision at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProvision {
    /// Short Server ID.
    pub ssid: Ssid,
    /// LwM2M Server URI.
    pub uri: String,
    /// Registration lifetime, defaulting to [`DeviceConfig::default_lifetime`].
    pub lifetime: Option<Duration>,
    /// Disable Timeout, defaulting to
    /// [`DeviceConfig::default_disable_timeout`].
    pub disable_timeout: Option<Duration>,
}

impl ServerProvision {
    /// Server with default timers.
    pub fn new(ssid: Ssid, uri: impl Into<String>) -> Self {
        Self { ssid, uri: uri.into(), lifetime: None, disable_timeout: None }
    }
}

/// Where admission sends a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Drop,
    Bootstrap,
    StartBootstrap,
    Server(Ssid),
}

/// The LwM2M client device.
///
/// # Type Parameters
///
/// - `E`: Environment implementation for time/randomness
pub struct Device<E: Environment> {
    env: E,
    config: DeviceConfig,
    tree: ObjectTree,
    access: AccessControl,
    servers: ServerRegistry,
    bootstrap: BootstrapSession,
    peers: HashMap<PeerId, PeerRole>,
    executables: HashMap<(u16, u16), ExecuteHandler>,
    started: bool,
}

impl<E: Environment> Device<E> {
    /// Device with the Security, Server, Access Control and Device objects
    /// declared and nothing provisioned.
    pub fn new(env: E, config: DeviceConfig) -> Self {
        let mut tree = ObjectTree::new();
        tree.register_object(oid::SECURITY, None);
        tree.register_object(oid::SERVER, None);
        tree.register_object(oid::ACCESS_CONTROL, None);
        tree.ensure_instance(oid::DEVICE, 0);

        Self {
            env,
            config,
            tree,
            access: AccessControl::default(),
            servers: ServerRegistry::new(),
            bootstrap: BootstrapSession::new(),
            peers: HashMap::new(),
            executables: HashMap::new(),
            started: false,
        }
    }

    /// Configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Object tree.
    pub fn tree(&self) -> &ObjectTree {
        &self.tree
    }

    /// Server Registration Entries.
    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    /// Access Control Gate.
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Phase of the current bootstrap session.
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }

    /// Peer bound while Bootstrapping.
    pub fn bound_peer(&self) -> Option<PeerId> {
        self.bootstrap.bound_peer()
    }

    /// Role of a known session.
    pub fn role_of(&self, peer: PeerId) -> Option<PeerRole> {
        self.peers.get(&peer).copied()
    }

    /// Declare an application object.
    pub fn register_object(&mut self, oid: u16, version: Option<&str>) {
        self.tree.register_object(oid, version);
    }

    /// Install the handler for executable resource `rid` of object `oid`.
    ///
    /// Server resources 4 (Disable) and 8 (Registration Update Trigger) are
    /// built in and cannot be overridden.
    pub fn register_executable<F>(&mut self, oid: u16, rid: u16, handler: F)
    where
        F: Fn(&mut Instance, &[u8]) -> Result<(), RequestError> + Send + Sync + 'static,
    {
        self.executables.insert((oid, rid), Arc::new(handler));
    }

    /// Local write, bypassing admission and access control. Creates the
    /// instance if needed.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Provisioning` if the object is not declared.
    pub fn set_resource(
        &mut self,
        path: &Path,
        value: impl Into<Bytes>,
    ) -> Result<(), DeviceError> {
        self.tree.write_resource(path, value.into(), true)?;
        self.resync();
        Ok(())
    }

    /// Provision a regular server: a Security instance, a Server instance
    /// and an Access Control entry owned by the server.
    ///
    /// # Errors
    ///
    /// - `DuplicateServer` if the SSID is taken
    /// - `ReservedSsid` for SSID 65535
    pub fn provision_server(&mut self, provision: ServerProvision) -> Result<(), DeviceError> {
        let ssid = provision.ssid;
        if ssid == Ssid::BOOTSTRAP {
            return Err(DeviceError::ReservedSsid { ssid });
        }
        if self.servers.get(ssid).is_some() {
            return Err(DeviceError::DuplicateServer { ssid });
        }

        let ssid_text = text(ssid.0);
        let security_iid = self.provision_instance(oid::SECURITY, ssid.0)?;
        self.tree.write_instance(
            oid::SECURITY,
            security_iid,
            &[
                (security::SERVER_URI, Bytes::from(provision.uri)),
                (security::BOOTSTRAP_SERVER, Bytes::from_static(b"0")),
                (security::SECURITY_MODE, Bytes::from_static(SECURITY_MODE_NOSEC.as_bytes())),
                (security::SHORT_SERVER_ID, ssid_text.clone()),
            ],
            false,
        )?;

        let lifetime = provision.lifetime.unwrap_or(self.config.default_lifetime);
        let disable_timeout =
            provision.disable_timeout.unwrap_or(self.config.default_disable_timeout);
        let server_iid = self.provision_instance(oid::SERVER, ssid.0)?;
        self.tree.write_instance(
            oid::SERVER,
            server_iid,
            &[
                (server::SHORT_SERVER_ID, ssid_text),
                (server::LIFETIME, text(lifetime.as_secs())),
                (server::DISABLE_TIMEOUT, text(disable_timeout.as_secs())),
                (server::BINDING, Bytes::from_static(b"U")),
            ],
            false,
        )?;

        self.resync();
        Ok(())
    }

    /// Provision the Bootstrap-Server Security instance.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateServer` if one is already provisioned.
    pub fn provision_bootstrap_server(&mut self, uri: &str) -> Result<(), DeviceError> {
        if bootstrap_uri(&self.tree).is_some() {
            return Err(DeviceError::DuplicateServer { ssid: Ssid::BOOTSTRAP });
        }

        let iid = self.provision_instance(oid::SECURITY, 0)?;
        self.tree.write_instance(
            oid::SECURITY,
            iid,
            &[
                (security::SERVER_URI, Bytes::from(uri.to_string())),
                (security::BOOTSTRAP_SERVER, Bytes::from_static(b"1")),
                (security::SECURITY_MODE, Bytes::from_static(SECURITY_MODE_NOSEC.as_bytes())),
            ],
            false,
        )?;
        Ok(())
    }

    /// Merge an Access Control entry into the tree.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Provisioning` if the Access Control object is
    /// full.
    pub fn add_access_entry(&mut self, entry: AccessEntry) -> Result<(), DeviceError> {
        self.upsert_access_entry(entry)?;
        Ok(())
    }

    /// Begin operation: register with every provisioned server, or ask for
    /// a bootstrap connection when there is none.
    pub fn start(&mut self) -> Vec<DeviceAction> {
        self.started = true;

        if self.servers.is_empty() {
            return match bootstrap_uri(&self.tree) {
                Some(uri) => vec![
                    DeviceAction::log(LogLevel::Info, "no server provisioned, bootstrapping"),
                    DeviceAction::ConnectBootstrapServer { uri },
                ],
                None => vec![DeviceAction::log(
                    LogLevel::Error,
                    "neither a server nor a bootstrap server is provisioned",
                )],
            };
        }

        let mut actions = Vec::new();
        for entry in self.servers.iter_mut() {
            if entry.state == ServerState::Idle {
                entry.state = ServerState::Registering;
                actions.push(register_action(entry));
            }
        }
        actions
    }

    /// Process an event and return resulting actions.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if a session or registration event references
    /// an unknown server or arrives in a state where it cannot apply.
    /// Requests never fail here; their errors become responses.
    pub fn handle(&mut self, event: DeviceEvent) -> Result<Vec<DeviceAction>, DeviceError> {
        match event {
            DeviceEvent::Request(request) => Ok(self.handle_request(request)),
            DeviceEvent::SessionEstablished { peer, role, ticket } => {
                self.handle_session_established(peer, role, ticket)
            },
            DeviceEvent::SessionResumed { ssid, peer, ticket, resumed } => {
                self.handle_session_resumed(ssid, peer, ticket, resumed)
            },
            DeviceEvent::SessionLost { peer } => Ok(self.handle_session_lost(peer)),
            DeviceEvent::BootstrapRequested { peer } => Ok(self.handle_bootstrap_requested(peer)),
            DeviceEvent::RegistrationCompleted { ssid } => {
                self.handle_registration_completed(ssid)
            },
            DeviceEvent::RegistrationFailed { ssid, reason } => {
                self.handle_registration_failed(ssid, &reason)
            },
            DeviceEvent::Tick { now } => Ok(self.handle_tick(now)),
        }
    }

    /// Answer a request that needs no mutation.
    ///
    /// Returns `None` when exclusive access is required; the caller then
    /// retries with [`Device::handle`]. Dropped requests yield an empty
    /// action list.
    pub fn try_handle_shared(&self, request: &Request) -> Option<Vec<DeviceAction>> {
        match self.route(request) {
            Route::Drop => {
                tracing::trace!(peer = %request.peer, path = %request.path, "dropping request");
                Some(Vec::new())
            },
            Route::Server(ssid) if request.method.is_read_only() => {
                let result = Path::parse(&request.path)
                    .map_err(RequestError::from)
                    .and_then(|path| self.serve_read_only(ssid, request.method, &path));
                match result {
                    Err(err) if err.is_fatal() => None,
                    result => Some(vec![DeviceAction::Respond {
                        peer: request.peer,
                        message_id: request.message_id,
                        response: into_response(result),
                    }]),
                }
            },
            Route::Bootstrap | Route::StartBootstrap | Route::Server(_) => None,
        }
    }

    /// Earliest instant at which a `Tick` has work to do.
    ///
    /// Server timers are frozen while Bootstrapping.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.bootstrap.is_bootstrapping() {
            self.bootstrap.deadline()
        } else {
            self.servers.next_deadline()
        }
    }

    /// True if the device currently services traffic from `peer`.
    pub fn is_session_active(&self, peer: PeerId) -> bool {
        if self.bootstrap.is_bootstrapping() {
            return self.bootstrap.bound_peer() == Some(peer);
        }
        match self.peers.get(&peer) {
            Some(PeerRole::Bootstrap) => true,
            Some(PeerRole::Server(ssid)) => self
                .servers
                .get(*ssid)
                .is_some_and(|entry| entry.peer == Some(peer) && entry.state.accepts_traffic()),
            None => false,
        }
    }

    /// Number of sessions the device currently services.
    pub fn active_session_count(&self) -> usize {
        self.peers.keys().filter(|peer| self.is_session_active(**peer)).count()
    }

    fn route(&self, request: &Request) -> Route {
        if self.bootstrap.is_bootstrapping() {
            return match self.bootstrap.admit(request.peer) {
                Admission::Admit => Route::Bootstrap,
                Admission::Drop => Route::Drop,
            };
        }

        match self.peers.get(&request.peer) {
            Some(PeerRole::Bootstrap) => Route::StartBootstrap,
            Some(PeerRole::Server(ssid)) => match self.servers.get(*ssid) {
                Some(entry) if entry.state.accepts_traffic() => Route::Server(*ssid),
                _ => Route::Drop,
            },
            None => Route::Drop,
        }
    }

    fn handle_request(&mut self, request: Request) -> Vec<DeviceAction> {
        let now = self.env.now();
        match self.route(&request) {
            Route::Drop => {
                tracing::trace!(peer = %request.peer, path = %request.path, "dropping request");
                Vec::new()
            },
            Route::Bootstrap => {
                self.bootstrap.touch(now);
                self.serve_bootstrap(request, now)
            },
            Route::StartBootstrap => {
                let mut actions = self.enter_bootstrap(request.peer, now);
                actions.extend(self.serve_bootstrap(request, now));
                actions
            },
            Route::Server(ssid) => self.serve_server(ssid, request, now),
        }
    }

    fn serve_bootstrap(&mut self, request: Request, now: Instant) -> Vec<DeviceAction> {
        let Request { peer, message_id, method, path, payload } = request;
        let path = match Path::parse(&path) {
            Ok(path) => path,
            Err(err) => return self.reply(peer, message_id, Err(err.into()), now),
        };

        if method == Method::BootstrapFinish {
            if let Err(err) = validate_finish(&path, &payload) {
                return self.reply(peer, message_id, Err(err), now);
            }
            return match self.bootstrap.finish(peer) {
                Ok(bound) => {
                    let mut actions = vec![DeviceAction::Respond {
                        peer,
                        message_id,
                        response: Response::changed(),
                    }];
                    actions.extend(self.finish_bootstrap(bound));
                    actions
                },
                Err(err) => {
                    let err = RequestError::Inconsistent { reason: err.to_string() };
                    self.reply(peer, message_id, Err(err), now)
                },
            };
        }

        let mut follow_up = Vec::new();
        let result = match method {
            Method::Discover => self.discover(&path, DiscoverMode::Bootstrap),
            Method::Read | Method::Observe => self.read(&path),
            Method::Write => self.bootstrap_write(&path, payload).map(|()| Response::changed()),
            Method::Create => self.create(&path, payload, None),
            Method::Delete => self.bootstrap_delete(&path).map(|()| Response::deleted()),
            Method::Execute => self.execute(&path, &payload, None, now, &mut follow_up),
            Method::BootstrapFinish => Err(RequestError::MethodNotAllowed),
        };
        self.conclude(peer, message_id, method, result, follow_up, now)
    }

    fn serve_server(&mut self, ssid: Ssid, request: Request, now: Instant) -> Vec<DeviceAction> {
        let Request { peer, message_id, method, path, payload } = request;
        let path = match Path::parse(&path) {
            Ok(path) => path,
            Err(err) => return self.reply(peer, message_id, Err(err.into()), now),
        };

        let mut follow_up = Vec::new();
        let result = match method {
            Method::Read | Method::Observe | Method::Discover => {
                self.serve_read_only(ssid, method, &path)
            },
            Method::BootstrapFinish => Err(RequestError::MethodNotAllowed),
            Method::Write | Method::Create | Method::Delete | Method::Execute => self
                .authorize(ssid, method, &path)
                .and_then(|()| match method {
                    Method::Write => self.write(&path, payload).map(|()| Response::changed()),
                    Method::Create => self.create(&path, payload, Some(ssid)),
                    Method::Delete => self.delete(&path).map(|()| Response::deleted()),
                    _ => self.execute(&path, &payload, Some(ssid), now, &mut follow_up),
                }),
        };
        self.conclude(peer, message_id, method, result, follow_up, now)
    }

    fn serve_read_only(
        &self,
        ssid: Ssid,
        method: Method,
        path: &Path,
    ) -> Result<Response, RequestError> {
        let single_server = self.single_server();
        match method {
            Method::Discover => {
                let visible = |oid: u16, iid: Option<u16>| {
                    self.access.is_visible(&self.tree, ssid, oid, iid, single_server)
                };
                self.discover(path, DiscoverMode::Server(&visible))
            },
            Method::Read | Method::Observe => {
                self.authorize(ssid, method, path)?;
                self.read(path)
            },
            _ => Err(RequestError::MethodNotAllowed),
        }
    }

    fn conclude(
        &mut self,
        peer: PeerId,
        message_id: u16,
        method: Method,
        result: Result<Response, RequestError>,
        follow_up: Vec<DeviceAction>,
        now: Instant,
    ) -> Vec<DeviceAction> {
        let mutated = result.is_ok() && !method.is_read_only();
        let mut actions = self.reply(peer, message_id, result, now);
        actions.extend(follow_up);
        if mutated {
            actions.extend(self.resync());
        }
        actions
    }

    fn reply(
        &mut self,
        peer: PeerId,
        message_id: u16,
        result: Result<Response, RequestError>,
        now: Instant,
    ) -> Vec<DeviceAction> {
        let fatal = result.as_ref().err().filter(|err| err.is_fatal()).map(ToString::to_string);
        let mut actions =
            vec![DeviceAction::Respond { peer, message_id, response: into_response(result) }];

        if let Some(reason) = fatal {
            actions.push(DeviceAction::log(
                LogLevel::Error,
                format!("tearing down session {peer}: {reason}"),
            ));
            actions.extend(self.tear_down(peer, now));
        }
        actions
    }

    /// Close one session after a fatal error. Other sessions are untouched.
    fn tear_down(&mut self, peer: PeerId, now: Instant) -> Vec<DeviceAction> {
        if let Some(PeerRole::Server(ssid)) = self.peers.remove(&peer) {
            if let Some(entry) = self.servers.get_mut(ssid) {
                entry.peer = None;
                if entry.state.accepts_traffic() {
                    let at = deadline(now, self.config.registration_retry);
                    entry.state = ServerState::RetryAt { at };
                }
            }
        }
        vec![DeviceAction::CloseSession { peer }]
    }

    fn single_server(&self) -> bool {
        self.servers.len() == 1
    }

    fn authorize(&self, ssid: Ssid, method: Method, path: &Path) -> Result<(), RequestError> {
        let oid = path.object_id().ok_or_else(|| unsupported(method, path))?;
        let target = AccessTarget { oid, iid: path.instance_id() };
        if self.access.permits(ssid, method, target, self.single_server()) {
            Ok(())
        } else {
            Err(RequestError::Unauthorized)
        }
    }

    fn discover(&self, path: &Path, mode: DiscoverMode<'_>) -> Result<Response, RequestError> {
        let body = DiscoverBuilder::new(&self.tree, self.config.version, mode).build(path)?;
        Ok(Response::content(ContentFormat::LinkFormat, body))
    }

    fn read(&self, path: &Path) -> Result<Response, RequestError> {
        let (oid, iid, rid) = resource_ids(path)?;
        let resource =
            self.tree.resource(oid, iid, rid).ok_or_else(|| RequestError::NotFound(path.clone()))?;

        let value = match (resource, path.resource_instance_id()) {
            (Resource::Single(value), None) => value.clone(),
            (Resource::Multiple(values), Some(riid)) => {
                values.get(&riid).cloned().ok_or_else(|| RequestError::NotFound(path.clone()))?
            },
            _ => return Err(unsupported(Method::Read, path)),
        };
        Ok(Response::content(ContentFormat::PlainText, value))
    }

    fn bootstrap_write(&mut self, path: &Path, payload: Payload) -> Result<(), RequestError> {
        match (path.kind(), payload) {
            (PathKind::Object, Payload::Instances(instances)) => {
                let oid = required(path.object_id(), Method::Write, path)?;
                for (iid, resources) in instances {
                    self.tree.write_instance(oid, iid, &resources, true)?;
                }
                Ok(())
            },
            (PathKind::Instance, Payload::Instance(resources)) => {
                let oid = required(path.object_id(), Method::Write, path)?;
                let iid = required(path.instance_id(), Method::Write, path)?;
                self.tree.write_instance(oid, iid, &resources, true)
            },
            (PathKind::Resource | PathKind::ResourceInstance, Payload::Text(value)) => {
                self.tree.write_resource(path, value, true)
            },
            _ => Err(malformed(path)),
        }
    }

    fn write(&mut self, path: &Path, payload: Payload) -> Result<(), RequestError> {
        match (path.kind(), payload) {
            (PathKind::Instance, Payload::Instance(resources)) => {
                let oid = required(path.object_id(), Method::Write, path)?;
                let iid = required(path.instance_id(), Method::Write, path)?;
                self.tree.write_instance(oid, iid, &resources, false)
            },
            (PathKind::Resource | PathKind::ResourceInstance, Payload::Text(value)) => {
                self.tree.write_resource(path, value, false)
            },
            _ => Err(malformed(path)),
        }
    }

    fn create(
        &mut self,
        path: &Path,
        payload: Payload,
        owner: Option<Ssid>,
    ) -> Result<Response, RequestError> {
        let oid = required(path.object_id(), Method::Create, path)?;
        let requested = match path.kind() {
            PathKind::Object => None,
            PathKind::Instance => path.instance_id(),
            _ => return Err(unsupported(Method::Create, path)),
        };
        let resources = match payload {
            Payload::Empty => Vec::new(),
            Payload::Instance(resources) => resources,
            Payload::Text(_) | Payload::Instances(_) => return Err(malformed(path)),
        };

        let iid = self.tree.create_instance(oid, requested)?;
        self.tree.write_instance(oid, iid, &resources, false)?;

        if let Some(owner) = owner {
            let target = AccessTarget { oid, iid: Some(iid) };
            if self.access.entry(target).is_none() {
                self.upsert_access_entry(AccessEntry::owned(target, owner))?;
            }
        }
        Ok(Response::created(Path::for_instance(oid, iid)))
    }

    fn delete(&mut self, path: &Path) -> Result<(), RequestError> {
        if path.kind() != PathKind::Instance {
            return Err(unsupported(Method::Delete, path));
        }
        let oid = required(path.object_id(), Method::Delete, path)?;
        let iid = required(path.instance_id(), Method::Delete, path)?;
        self.tree.delete_instance(oid, iid)?;
        self.prune_access_entries();
        Ok(())
    }

    /// Bootstrap-Delete. The Bootstrap-Server Security instance and the
    /// Device object instance survive every scope.
    fn bootstrap_delete(&mut self, path: &Path) -> Result<(), RequestError> {
        let survives = |oid: u16, instance: &Instance| {
            oid == oid::DEVICE || (oid == oid::SECURITY && is_bootstrap_security(instance))
        };

        match path.kind() {
            PathKind::Root => {
                let oids: Vec<u16> = self.tree.objects().map(|(oid, _)| oid).collect();
                for oid in oids {
                    self.tree.retain_instances(oid, |_, instance| survives(oid, instance));
                }
            },
            PathKind::Object => {
                let oid = required(path.object_id(), Method::Delete, path)?;
                if self.tree.object(oid).is_none() {
                    return Err(RequestError::NotFound(path.clone()));
                }
                self.tree.retain_instances(oid, |_, instance| survives(oid, instance));
            },
            PathKind::Instance => {
                let oid = required(path.object_id(), Method::Delete, path)?;
                let iid = required(path.instance_id(), Method::Delete, path)?;
                let instance = self
                    .tree
                    .instance(oid, iid)
                    .ok_or_else(|| RequestError::NotFound(path.clone()))?;
                if !survives(oid, instance) {
                    self.tree.delete_instance(oid, iid)?;
                }
            },
            PathKind::Resource | PathKind::ResourceInstance => {
                return Err(unsupported(Method::Delete, path));
            },
        }

        self.prune_access_entries();
        Ok(())
    }

    fn execute(
        &mut self,
        path: &Path,
        payload: &Payload,
        requester: Option<Ssid>,
        now: Instant,
        follow_up: &mut Vec<DeviceAction>,
    ) -> Result<Response, RequestError> {
        if path.kind() != PathKind::Resource {
            return Err(unsupported(Method::Execute, path));
        }
        let (oid, iid, rid) = resource_ids(path)?;
        if self.tree.instance(oid, iid).is_none() {
            return Err(RequestError::NotFound(Path::for_instance(oid, iid)));
        }

        if oid == oid::SERVER
            && matches!(rid, server::DISABLE | server::REGISTRATION_UPDATE_TRIGGER)
        {
            if requester.is_none() {
                return Err(RequestError::MethodNotAllowed);
            }
            return if rid == server::DISABLE {
                self.disable(iid, now, follow_up)
            } else {
                self.trigger_update(iid, now, follow_up)
            };
        }

        let handler =
            self.executables.get(&(oid, rid)).cloned().ok_or(RequestError::MethodNotAllowed)?;
        let arguments = match payload {
            Payload::Empty => Bytes::new(),
            Payload::Text(arguments) => arguments.clone(),
            Payload::Instance(_) | Payload::Instances(_) => return Err(malformed(path)),
        };

        let instance = self.tree.instance_mut(oid, iid)?;
        handler(instance, &arguments)?;
        Ok(Response::changed())
    }

    fn disable(
        &mut self,
        server_iid: u16,
        now: Instant,
        follow_up: &mut Vec<DeviceAction>,
    ) -> Result<Response, RequestError> {
        let ssid = self.server_by_iid(server_iid)?;
        let Some(entry) = self.servers.get_mut(ssid) else {
            return Err(RequestError::NotFound(Path::for_instance(oid::SERVER, server_iid)));
        };

        if let Some(peer) = entry.peer.take() {
            if matches!(entry.state, ServerState::Registered { .. }) {
                follow_up.push(DeviceAction::Deregister { ssid, peer });
            }
            self.peers.remove(&peer);
            follow_up.push(DeviceAction::CloseSession { peer });
        }

        entry.state = ServerState::Disabled { until: deadline(now, entry.disable_timeout) };
        follow_up.push(DeviceAction::log(
            LogLevel::Info,
            format!("server {ssid} disabled for {}s", entry.disable_timeout.as_secs()),
        ));
        Ok(Response::changed())
    }

    fn trigger_update(
        &mut self,
        server_iid: u16,
        now: Instant,
        follow_up: &mut Vec<DeviceAction>,
    ) -> Result<Response, RequestError> {
        let ssid = self.server_by_iid(server_iid)?;
        let Some(entry) = self.servers.get_mut(ssid) else {
            return Err(RequestError::NotFound(Path::for_instance(oid::SERVER, server_iid)));
        };

        match entry.state {
            ServerState::Registered { .. } => {
                let next_update = deadline(now, update_interval(entry.lifetime));
                entry.state = ServerState::Registered { next_update };
                follow_up.push(DeviceAction::Update { ssid });
                Ok(Response::changed())
            },
            _ => Err(RequestError::ServerUnavailable { ssid }),
        }
    }

    fn server_by_iid(&self, server_iid: u16) -> Result<Ssid, RequestError> {
        self.servers
            .by_server_iid(server_iid)
            .map(|entry| entry.ssid)
            .ok_or_else(|| RequestError::NotFound(Path::for_instance(oid::SERVER, server_iid)))
    }

    fn handle_session_established(
        &mut self,
        peer: PeerId,
        role: PeerRole,
        ticket: Option<SessionTicket>,
    ) -> Result<Vec<DeviceAction>, DeviceError> {
        if let PeerRole::Server(ssid) = role {
            let entry = self.servers.get_mut(ssid).ok_or(DeviceError::UnknownServer { ssid })?;
            if let Some(previous) = entry.peer.replace(peer).filter(|previous| *previous != peer) {
                self.peers.remove(&previous);
            }
            if ticket.is_some() {
                entry.ticket = ticket;
            }
        }
        self.peers.insert(peer, role);

        let message = format!("session {peer} established ({role:?})");
        Ok(vec![DeviceAction::log(LogLevel::Debug, message)])
    }

    fn handle_session_resumed(
        &mut self,
        ssid: Ssid,
        peer: PeerId,
        ticket: Option<SessionTicket>,
        resumed: bool,
    ) -> Result<Vec<DeviceAction>, DeviceError> {
        let now = self.env.now();
        let entry = self.servers.get_mut(ssid).ok_or(DeviceError::UnknownServer { ssid })?;
        if entry.state != ServerState::Resuming {
            return Err(DeviceError::UnexpectedEvent {
                reason: format!("server {ssid} is not resuming ({:?})", entry.state),
            });
        }

        if let Some(previous) = entry.peer.replace(peer).filter(|previous| *previous != peer) {
            self.peers.remove(&previous);
        }
        if ticket.is_some() {
            entry.ticket = ticket;
        }
        let next_update = deadline(now, update_interval(entry.lifetime));
        entry.state = ServerState::Registered { next_update };
        self.peers.insert(peer, PeerRole::Server(ssid));

        let mut actions = Vec::new();
        if !resumed {
            actions.push(DeviceAction::log(
                LogLevel::Warn,
                format!("server {ssid}: session resumption fell back to a full handshake"),
            ));
        }
        actions.push(DeviceAction::log(LogLevel::Info, format!("server {ssid} back on {peer}")));
        Ok(actions)
    }

    fn handle_session_lost(&mut self, peer: PeerId) -> Vec<DeviceAction> {
        let Some(role) = self.peers.remove(&peer) else {
            return Vec::new();
        };

        let ssid = match role {
            PeerRole::Server(ssid) => ssid,
            PeerRole::Bootstrap if self.bootstrap.bound_peer() == Some(peer) => {
                return vec![DeviceAction::log(
                    LogLevel::Warn,
                    "bootstrap session lost, waiting for the bootstrap timeout",
                )];
            },
            PeerRole::Bootstrap => return Vec::new(),
        };

        let Some(entry) = self.servers.get_mut(ssid) else {
            return Vec::new();
        };
        if entry.peer == Some(peer) {
            entry.peer = None;
        }

        match entry.state {
            ServerState::Registering
            | ServerState::Registered { .. }
            | ServerState::RetryAt { .. } => match entry.ticket.clone() {
                Some(ticket) => {
                    entry.state = ServerState::Resuming;
                    entry.peer = Some(peer);
                    self.peers.insert(peer, role);
                    vec![DeviceAction::ResumeSession { ssid, peer, ticket }]
                },
                None => {
                    entry.state = ServerState::Registering;
                    vec![register_action(entry)]
                },
            },
            ServerState::Resuming => {
                entry.ticket = None;
                entry.state = ServerState::Registering;
                vec![
                    DeviceAction::log(
                        LogLevel::Warn,
                        format!("server {ssid}: resumption failed, registering afresh"),
                    ),
                    register_action(entry),
                ]
            },
            ServerState::Idle | ServerState::Suspended | ServerState::Disabled { .. } => {
                Vec::new()
            },
        }
    }

    fn handle_bootstrap_requested(&mut self, peer: PeerId) -> Vec<DeviceAction> {
        let now = self.env.now();
        let mut actions = self.enter_bootstrap(peer, now);
        actions.push(DeviceAction::SendBootstrapRequest { peer });
        actions
    }

    fn handle_registration_completed(
        &mut self,
        ssid: Ssid,
    ) -> Result<Vec<DeviceAction>, DeviceError> {
        let now = self.env.now();
        let entry = self.servers.get_mut(ssid).ok_or(DeviceError::UnknownServer { ssid })?;
        match entry.state {
            ServerState::Registering
            | ServerState::Registered { .. }
            | ServerState::RetryAt { .. } => {
                let next_update = deadline(now, update_interval(entry.lifetime));
                entry.state = ServerState::Registered { next_update };
                let message = format!("registered with server {ssid}");
                Ok(vec![DeviceAction::log(LogLevel::Info, message)])
            },
            state => Err(DeviceError::UnexpectedEvent {
                reason: format!("registration completed for server {ssid} in state {state:?}"),
            }),
        }
    }

    fn handle_registration_failed(
        &mut self,
        ssid: Ssid,
        reason: &str,
    ) -> Result<Vec<DeviceAction>, DeviceError> {
        let now = self.env.now();
        let retry = self.config.registration_retry;
        let entry = self.servers.get_mut(ssid).ok_or(DeviceError::UnknownServer { ssid })?;
        match entry.state {
            ServerState::Registering | ServerState::Registered { .. } => {
                entry.state = ServerState::RetryAt { at: deadline(now, retry) };
                Ok(vec![DeviceAction::log(
                    LogLevel::Warn,
                    format!("registration with server {ssid} failed: {reason}"),
                )])
            },
            state => Err(DeviceError::UnexpectedEvent {
                reason: format!("registration failure for server {ssid} in state {state:?}"),
            }),
        }
    }

    fn handle_tick(&mut self, now: Instant) -> Vec<DeviceAction> {
        if self.bootstrap.is_bootstrapping() {
            return match self.bootstrap.expire(now) {
                Some(peer) => {
                    let mut actions = vec![DeviceAction::log(
                        LogLevel::Warn,
                        format!("no Bootstrap-Finish from {peer}, finishing implicitly"),
                    )];
                    actions.extend(self.finish_bootstrap(peer));
                    actions
                },
                None => Vec::new(),
            };
        }

        let mut actions = Vec::new();
        for entry in self.servers.iter_mut() {
            match entry.state {
                ServerState::Registered { next_update } if next_update <= now => {
                    let next_update = deadline(now, update_interval(entry.lifetime));
                    entry.state = ServerState::Registered { next_update };
                    actions.push(DeviceAction::Update { ssid: entry.ssid });
                },
                ServerState::Disabled { until } if until <= now => {
                    entry.state = ServerState::Registering;
                    actions.push(DeviceAction::log(
                        LogLevel::Info,
                        format!("disable timeout of server {} elapsed", entry.ssid),
                    ));
                    actions.push(register_action(entry));
                },
                ServerState::RetryAt { at } if at <= now => {
                    entry.state = ServerState::Registering;
                    actions.push(register_action(entry));
                },
                _ => {},
            }
        }
        actions
    }

    /// Replace the bootstrap session with a fresh one bound to `peer` and
    /// park every live server session.
    fn enter_bootstrap(&mut self, peer: PeerId, now: Instant) -> Vec<DeviceAction> {
        self.bootstrap = BootstrapSession::begin(peer, now, self.config.bootstrap_timeout);
        self.peers.insert(peer, PeerRole::Bootstrap);

        let mut actions =
            vec![DeviceAction::log(LogLevel::Info, format!("bootstrapping with {peer}"))];
        for entry in self.servers.iter_mut() {
            match entry.state {
                ServerState::Registering
                | ServerState::Registered { .. }
                | ServerState::RetryAt { .. }
                | ServerState::Resuming => {
                    entry.state = ServerState::Suspended;
                    if let Some(peer) = entry.peer {
                        actions.push(DeviceAction::SuspendSession { ssid: entry.ssid, peer });
                    }
                },
                ServerState::Idle | ServerState::Suspended | ServerState::Disabled { .. } => {},
            }
        }
        actions
    }

    /// Leave Bootstrapping (the session has already transitioned): close the
    /// bootstrap session, resume parked sessions, register new servers.
    fn finish_bootstrap(&mut self, peer: PeerId) -> Vec<DeviceAction> {
        self.peers.remove(&peer);
        let mut actions = vec![DeviceAction::CloseSession { peer }];
        actions.extend(self.resync());

        for entry in self.servers.iter_mut() {
            match (entry.state, entry.peer, entry.ticket.clone()) {
                (ServerState::Suspended, Some(peer), Some(ticket)) => {
                    entry.state = ServerState::Resuming;
                    actions.push(DeviceAction::ResumeSession { ssid: entry.ssid, peer, ticket });
                },
                (ServerState::Suspended | ServerState::Idle, _, _) => {
                    entry.state = ServerState::Registering;
                    actions.push(register_action(entry));
                },
                _ => {},
            }
        }

        actions.push(DeviceAction::log(LogLevel::Info, "bootstrap finished"));
        actions
    }

    /// Bring the registry and the gate back in line with the tree.
    fn resync(&mut self) -> Vec<DeviceAction> {
        let defaults = EntryDefaults {
            lifetime: self.config.default_lifetime,
            disable_timeout: self.config.default_disable_timeout,
        };
        let report = self.servers.sync(&self.tree, defaults);
        let mut actions = Vec::new();

        for removed in report.removed {
            let message = format!("server {} removed", removed.ssid);
            actions.push(DeviceAction::log(LogLevel::Info, message));
            if let Some(peer) = removed.peer {
                if matches!(removed.state, ServerState::Registered { .. }) {
                    actions.push(DeviceAction::Deregister { ssid: removed.ssid, peer });
                }
                self.peers.remove(&peer);
                actions.push(DeviceAction::CloseSession { peer });
            }
        }

        self.access = AccessControl::from_tree(&self.tree);
        for ssid in &report.added {
            let Some(server_iid) = self.servers.get(*ssid).map(|entry| entry.server_iid) else {
                continue;
            };
            let target = AccessTarget { oid: oid::SERVER, iid: Some(server_iid) };
            if self.access.entry(target).is_none() {
                if let Err(err) = self.upsert_access_entry(AccessEntry::owned(target, *ssid)) {
                    actions.push(DeviceAction::log(
                        LogLevel::Error,
                        format!("cannot create access entry for server {ssid}: {err}"),
                    ));
                }
            }
        }

        if self.started && !self.bootstrap.is_bootstrapping() {
            for ssid in report.added {
                if let Some(entry) = self.servers.get_mut(ssid) {
                    entry.state = ServerState::Registering;
                    actions.push(register_action(entry));
                }
            }
        }

        tracing::trace!(servers = self.servers.len(), "resynchronised");
        actions
    }

    /// Create an Access Control instance for `entry.target`, or merge the
    /// grants into the existing one.
    fn upsert_access_entry(&mut self, entry: AccessEntry) -> Result<(), RequestError> {
        let existing = self.tree.object(oid::ACCESS_CONTROL).and_then(|object| {
            object.instances().find_map(|(iid, instance)| {
                AccessEntry::from_instance(instance)
                    .filter(|current| current.target == entry.target)
                    .map(|current| (iid, current))
            })
        });

        let (iid, merged) = match existing {
            Some((iid, mut current)) => {
                current.acl.extend(entry.acl);
                (iid, current)
            },
            None => (self.tree.create_instance(oid::ACCESS_CONTROL, None)?, entry),
        };

        *self.tree.instance_mut(oid::ACCESS_CONTROL, iid)? = merged.to_instance();
        self.access = AccessControl::from_tree(&self.tree);
        Ok(())
    }

    /// Drop Access Control instances whose target instance no longer
    /// exists.
    fn prune_access_entries(&mut self) {
        let stale: Vec<u16> = self
            .tree
            .object(oid::ACCESS_CONTROL)
            .into_iter()
            .flat_map(|object| object.instances())
            .filter_map(|(acl_iid, instance)| {
                let entry = AccessEntry::from_instance(instance)?;
                let iid = entry.target.iid?;
                self.tree.instance(entry.target.oid, iid).is_none().then_some(acl_iid)
            })
            .collect();

        if !stale.is_empty() {
            self.tree.retain_instances(oid::ACCESS_CONTROL, |iid, _| !stale.contains(&iid));
        }
        self.access = AccessControl::from_tree(&self.tree);
    }

    /// Instance id for provisioning: `preferred` if usable, else the lowest
    /// free one.
    fn provision_instance(&mut self, oid: u16, preferred: u16) -> Result<u16, RequestError> {
        let preferred = (preferred <= MAX_INSTANCE_ID
            && self.tree.instance(oid, preferred).is_none())
        .then_some(preferred);
        self.tree.create_instance(oid, preferred)
    }
}

fn register_action(entry: &ServerEntry) -> DeviceAction {
    DeviceAction::Register { ssid: entry.ssid, uri: entry.uri.clone(), lifetime: entry.lifetime }
}

/// `now + after`, saturating at [`MAX_TIMER`].
fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(MAX_TIMER)).unwrap_or(now)
}

fn update_interval(lifetime: Duration) -> Duration {
    (lifetime / 2).max(MIN_UPDATE_INTERVAL)
}

fn into_response(result: Result<Response, RequestError>) -> Response {
    result.unwrap_or_else(|err| Response::empty(err.code()))
}

fn validate_finish(path: &Path, payload: &Payload) -> Result<(), RequestError> {
    if !path.is_root() {
        return Err(unsupported(Method::BootstrapFinish, path));
    }
    if !payload.is_empty() {
        return Err(ProtocolError::MalformedPayload {
            reason: "Bootstrap-Finish carries no payload".to_string(),
        }
        .into());
    }
    Ok(())
}

fn required(id: Option<u16>, method: Method, path: &Path) -> Result<u16, RequestError> {
    id.ok_or_else(|| unsupported(method, path))
}

fn unsupported(method: Method, path: &Path) -> RequestError {
    ProtocolError::UnsupportedTarget { method: method.to_string(), target: path.to_string() }.into()
}

fn malformed(path: &Path) -> RequestError {
    ProtocolError::MalformedPayload { reason: format!("payload does not fit {path}") }.into()
}

fn text(value: impl ToString) -> Bytes {
    Bytes::from(value.to_string())
}
