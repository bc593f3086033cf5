//! Runtime configuration.
//!
//! [`ClientConfig`] is what the binary assembles from its flags. It also
//! deserializes, with every field optional, so embedders can keep it in a
//! configuration file of their choice.

use std::{str::FromStr, time::Duration};

use lwm2m_core::{AccessEntry, Device, DeviceConfig, Environment, ServerProvision, Ssid};
use serde::{Deserialize, Deserializer, de};

use crate::{error::ClientError, transport::authority};

/// One regular LwM2M Server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Short Server ID.
    pub ssid: u16,
    /// Server URI, e.g. `coap://127.0.0.1:5683`.
    pub uri: String,
    /// Registration lifetime; the device default when absent.
    #[serde(default)]
    pub lifetime: Option<Duration>,
    /// Disable Timeout; the device default when absent.
    #[serde(default)]
    pub disable_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Provisioning request for the device.
    pub fn provision(&self) -> ServerProvision {
        ServerProvision {
            ssid: Ssid(self.ssid),
            uri: self.uri.clone(),
            lifetime: self.lifetime,
            disable_timeout: self.disable_timeout,
        }
    }
}

impl FromStr for ServerConfig {
    type Err = ClientError;

    /// Parse the command-line form `SSID,URI`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (ssid, uri) = text
            .split_once(',')
            .ok_or_else(|| ClientError::Config(format!("expected SSID,URI, got {text:?}")))?;
        let ssid = ssid
            .trim()
            .parse()
            .map_err(|_| ClientError::Config(format!("invalid short server id in {text:?}")))?;
        Ok(Self { ssid, uri: uri.trim().to_string(), lifetime: None, disable_timeout: None })
    }
}

/// Everything the runtime needs to start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint client name sent in Register and Bootstrap-Request.
    pub endpoint: String,
    /// Local address of the UDP socket.
    pub bind: String,
    /// Bootstrap Server URI.
    pub bootstrap_server: Option<String>,
    /// Servers provisioned at start-up.
    pub servers: Vec<ServerConfig>,
    /// Access Control entries in `/OID[/IID],SSID,MASK` form.
    #[serde(deserialize_with = "access_entries")]
    pub access_entries: Vec<AccessEntry>,
    /// Bound on every connect, resume and registration exchange.
    pub connect_timeout: Duration,
    /// Device timers and protocol version.
    pub device: DeviceConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "lwm2m-client".to_string(),
            bind: "0.0.0.0:0".to_string(),
            bootstrap_server: None,
            servers: Vec::new(),
            access_entries: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            device: DeviceConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Check the configuration before anything is bound.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.endpoint.is_empty() {
            return Err(ClientError::Config("endpoint name must not be empty".to_string()));
        }
        if self.servers.is_empty() && self.bootstrap_server.is_none() {
            return Err(ClientError::Config(
                "at least one server or a bootstrap server is required".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::Config("connect timeout must be positive".to_string()));
        }

        let uris = self.servers.iter().map(|server| server.uri.as_str());
        for uri in uris.chain(self.bootstrap_server.as_deref()) {
            authority(uri)?;
        }
        Ok(())
    }

    /// Device with the configured servers and access entries provisioned.
    pub fn build_device<E: Environment>(&self, env: E) -> Result<Device<E>, ClientError> {
        self.validate()?;

        let mut device = Device::new(env, self.device.clone());
        if let Some(uri) = &self.bootstrap_server {
            device.provision_bootstrap_server(uri)?;
        }
        for server in &self.servers {
            device.provision_server(server.provision())?;
        }
        for entry in &self.access_entries {
            device.add_access_entry(entry.clone())?;
        }
        Ok(device)
    }
}

fn access_entries<'de, D>(deserializer: D) -> Result<Vec<AccessEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|text| text.parse().map_err(de::Error::custom))
        .collect()
}
