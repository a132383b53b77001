//! Application settings with persistence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::types::Timeouts;
use crate::models::connection::LOOPBACK_HOST;

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Host the SSH tunnels listen on.
    #[serde(default = "default_local_bind_host")]
    pub local_bind_host: String,
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            timeouts: TimeoutSettings::default(),
            local_bind_host: default_local_bind_host(),
            strict_host_key_checking: false,
        }
    }
}

impl AppSettings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            tunnel: Duration::from_secs(self.timeouts.tunnel_secs),
            connect: Duration::from_secs(self.timeouts.connect_secs),
            operation: Duration::from_secs(self.timeouts.operation_secs),
        }
    }
}

/// Timeouts in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_tunnel_secs")]
    pub tunnel_secs: u64,
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_operation_secs")]
    pub operation_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            tunnel_secs: default_tunnel_secs(),
            connect_secs: default_connect_secs(),
            operation_secs: default_operation_secs(),
        }
    }
}

fn default_local_bind_host() -> String {
    LOOPBACK_HOST.to_string()
}

fn default_tunnel_secs() -> u64 {
    10
}

fn default_connect_secs() -> u64 {
    10
}

fn default_operation_secs() -> u64 {
    30
}
