//! Server Registration Entries.
//!
//! One entry per provisioned LwM2M Server object instance, keyed by Short
//! Server ID. The registry is a projection of the Security and Server
//! objects in the tree: [`ServerRegistry::sync`] reconciles it after every
//! mutation of those objects, carrying over the state of entries whose SSID
//! survives and dropping the rest (which cancels their timers, since timers
//! are deadlines stored in the entry).

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use lwm2m_proto::{PeerId, SessionTicket};
use serde::{Deserialize, Serialize};

use crate::dm::{Instance, ObjectTree, Resource, oid, security, server};

/// Short Server ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ssid(pub u16);

impl Ssid {
    /// Marks entries owned by the bootstrap server.
    pub const BOOTSTRAP: Self = Self(65535);
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Provisioned, no registration attempted yet.
    Idle,
    /// Register emitted, waiting for the outcome.
    Registering,
    /// Registered; an Update is due at `next_update`.
    Registered {
        /// Lifetime-driven Update deadline.
        next_update: Instant,
    },
    /// Session parked while the device is bootstrapping.
    Suspended,
    /// Resumption emitted after bootstrap, waiting for the transport.
    Resuming,
    /// Disabled by the Disable resource until `until`.
    Disabled {
        /// Re-registration deadline.
        until: Instant,
    },
    /// Registration failed; retry at `at`.
    RetryAt {
        /// Retry deadline.
        at: Instant,
    },
}

impl ServerState {
    /// Deadline carried by this state, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Registered { next_update } => Some(*next_update),
            Self::Disabled { until } => Some(*until),
            Self::RetryAt { at } => Some(*at),
            Self::Idle | Self::Registering | Self::Suspended | Self::Resuming => None,
        }
    }

    /// True while the server's session is up and accepting traffic.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, Self::Registering | Self::Registered { .. } | Self::RetryAt { .. })
    }
}

/// Per-server registration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    /// Short Server ID.
    pub ssid: Ssid,
    /// Server instance id in object 1.
    pub server_iid: u16,
    /// LwM2M Server URI from the matching Security instance.
    pub uri: String,
    /// Registration lifetime.
    pub lifetime: Duration,
    /// How long the server stays disabled after Disable.
    pub disable_timeout: Duration,
    /// Registration state.
    pub state: ServerState,
    /// Current transport session.
    pub peer: Option<PeerId>,
    /// Resumption ticket from the last established session.
    pub ticket: Option<SessionTicket>,
}

/// Defaults applied when a Server instance omits a resource.
#[derive(Debug, Clone, Copy)]
pub struct EntryDefaults {
    /// Lifetime when resource 1 is absent.
    pub lifetime: Duration,
    /// Disable Timeout when resource 5 is absent.
    pub disable_timeout: Duration,
}

/// What changed in a [`ServerRegistry::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// SSIDs that were not present before.
    pub added: Vec<Ssid>,
    /// Entries that disappeared, with their last state.
    pub removed: Vec<ServerEntry>,
}

/// All Server Registration Entries.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    entries: BTreeMap<Ssid, ServerEntry>,
}

impl ServerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with the Security and Server objects of `tree`.
    pub fn sync(&mut self, tree: &ObjectTree, defaults: EntryDefaults) -> SyncReport {
        let mut report = SyncReport::default();
        let mut next = BTreeMap::new();

        let Some(servers) = tree.object(oid::SERVER) else {
            report.removed = std::mem::take(&mut self.entries).into_values().collect();
            return report;
        };

        for (server_iid, instance) in servers.instances() {
            let Some(ssid) = instance.get(&server::SHORT_SERVER_ID).and_then(as_ssid) else {
                tracing::trace!(server_iid, "server instance without short server id");
                continue;
            };

            let uri = server_uri(tree, ssid).unwrap_or_default();
            let lifetime = seconds(instance, server::LIFETIME).unwrap_or(defaults.lifetime);
            let disable_timeout =
                seconds(instance, server::DISABLE_TIMEOUT).unwrap_or(defaults.disable_timeout);

            let entry = match self.entries.remove(&ssid) {
                Some(existing) => {
                    ServerEntry { server_iid, uri, lifetime, disable_timeout, ..existing }
                },
                None => {
                    report.added.push(ssid);
                    ServerEntry {
                        ssid,
                        server_iid,
                        uri,
                        lifetime,
                        disable_timeout,
                        state: ServerState::Idle,
                        peer: None,
                        ticket: None,
                    }
                },
            };
            next.insert(ssid, entry);
        }

        report.removed = std::mem::replace(&mut self.entries, next).into_values().collect();
        report
    }

    /// One entry.
    pub fn get(&self, ssid: Ssid) -> Option<&ServerEntry> {
        self.entries.get(&ssid)
    }

    /// One entry, mutably.
    pub fn get_mut(&mut self, ssid: Ssid) -> Option<&mut ServerEntry> {
        self.entries.get_mut(&ssid)
    }

    /// Entries in ascending SSID order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.values()
    }

    /// Entries in ascending SSID order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerEntry> {
        self.entries.values_mut()
    }

    /// Number of provisioned servers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no server is provisioned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry whose Server instance is `server_iid`.
    pub fn by_server_iid(&self, server_iid: u16) -> Option<&ServerEntry> {
        self.entries.values().find(|entry| entry.server_iid == server_iid)
    }

    /// Earliest deadline across all entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|entry| entry.state.deadline()).min()
    }
}

/// URI of the Security instance that carries `ssid`.
pub fn server_uri(tree: &ObjectTree, ssid: Ssid) -> Option<String> {
    let securities = tree.object(oid::SECURITY)?;
    securities
        .instances()
        .filter(|(_, instance)| !is_bootstrap_security(instance))
        .find(|(_, instance)| {
            instance.get(&security::SHORT_SERVER_ID).and_then(as_ssid) == Some(ssid)
        })
        .and_then(|(_, instance)| instance.get(&security::SERVER_URI)?.as_text().map(String::from))
}

/// URI of the Bootstrap-Server Security instance.
pub fn bootstrap_uri(tree: &ObjectTree) -> Option<String> {
    tree.object(oid::SECURITY)?
        .instances()
        .find(|(_, instance)| is_bootstrap_security(instance))
        .and_then(|(_, instance)| instance.get(&security::SERVER_URI)?.as_text().map(String::from))
}

/// True if a Security instance describes the Bootstrap Server.
pub fn is_bootstrap_security(instance: &Instance) -> bool {
    instance.get(&security::BOOTSTRAP_SERVER).and_then(Resource::as_bool).unwrap_or(false)
}

fn as_ssid(resource: &Resource) -> Option<Ssid> {
    resource.as_u64().and_then(|value| u16::try_from(value).ok()).map(Ssid)
}

fn seconds(instance: &Instance, rid: u16) -> Option<Duration> {
    instance.get(&rid).and_then(Resource::as_u64).map(Duration::from_secs)
}
