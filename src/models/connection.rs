// Connection configuration models

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Driver options as supplied by the operator (a JSON object).
pub type DriverOptions = Map<String, Value>;

/// Parse operator-supplied driver options. Blank input means no options.
pub fn parse_driver_options(raw: &str) -> Result<DriverOptions> {
    if raw.trim().is_empty() {
        return Ok(DriverOptions::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(options)) => Ok(options),
        Ok(_) => Err(Error::InvalidOptions("connection options must be a JSON object".to_string())),
        Err(err) => Err(Error::InvalidOptions(err.to_string())),
    }
}

/// A connection the registry can bring up.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    pub connection_string: String,
    pub driver_options: DriverOptions,
    pub tunnel: Option<SshTunnelConfig>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            driver_options: DriverOptions::new(),
            tunnel: None,
        }
    }

    pub fn with_driver_options(mut self, options: DriverOptions) -> Self {
        self.driver_options = options;
        self
    }

    pub fn with_tunnel(mut self, tunnel: Option<SshTunnelConfig>) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Rebuild a config from its persisted form.
    pub fn from_stored(name: impl Into<String>, stored: StoredConnection) -> Self {
        Self {
            name: name.into(),
            connection_string: stored.connection_string,
            driver_options: stored.connection_options,
            tunnel: stored.ssh_options,
        }
    }

    pub fn to_stored(&self) -> StoredConnection {
        StoredConnection {
            connection_string: self.connection_string.clone(),
            connection_options: self.driver_options.clone(),
            ssh_options: self.tunnel.clone(),
        }
    }

    /// The tunnel config, only when it is switched on.
    pub fn active_tunnel(&self) -> Option<&SshTunnelConfig> {
        self.tunnel.as_ref().filter(|tunnel| tunnel.enabled)
    }
}

/// SSH authentication material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SshAuth {
    Password {
        password: String,
    },
    PrivateKey {
        #[serde(rename = "privateKey")]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// Local port forward definition: `local_host:local_port` → (via `host`) →
/// `dst_host:dst_port`. A `local_port` of 0 asks the OS for an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTunnelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub dst_host: String,
    pub dst_port: u16,
    pub local_host: String,
    pub local_port: u16,
    #[serde(flatten)]
    pub auth: SshAuth,
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl SshTunnelConfig {
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Whether concurrent scopes would fight over the same local listener.
    pub fn has_fixed_local_port(&self) -> bool {
        self.local_port != 0
    }
}

/// SSH settings as typed by the operator in the connection form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshOptionsInput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_method: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
}

impl SshOptionsInput {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|err| Error::InvalidOptions(format!("SSH options: {err}")))
    }

    /// Derive the forward for a database listening on `db_port` behind the SSH
    /// host. Returns `None` when tunnelling is switched off.
    pub fn into_tunnel_config(
        self,
        db_port: u16,
        local_bind_host: &str,
        strict_host_key_checking: bool,
    ) -> Option<SshTunnelConfig> {
        if !self.enabled {
            return None;
        }

        let auth = if self.auth_method == "password" {
            SshAuth::Password { password: self.password.unwrap_or_default() }
        } else {
            SshAuth::PrivateKey {
                path: self.key_path.unwrap_or_default(),
                passphrase: self.key_passphrase.filter(|p| !p.is_empty()),
            }
        };

        Some(SshTunnelConfig {
            enabled: true,
            host: self.address,
            username: self.username,
            port: self.port,
            dst_host: LOOPBACK_HOST.to_string(),
            dst_port: db_port,
            local_host: local_bind_host.to_string(),
            local_port: db_port,
            auth,
            strict_host_key_checking,
        })
    }
}

/// Persisted shape of a connection in the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConnection {
    pub connection_string: String,
    #[serde(default)]
    pub connection_options: DriverOptions,
    #[serde(default, deserialize_with = "deserialize_ssh_options")]
    pub ssh_options: Option<SshTunnelConfig>,
}

/// Legacy stores write `{}` for "no tunnel".
fn deserialize_ssh_options<'de, D>(deserializer: D) -> std::result::Result<Option<SshTunnelConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other).map(Some).map_err(serde::de::Error::custom),
    }
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}
