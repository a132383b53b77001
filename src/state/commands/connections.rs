use crate::connection::broker::TunnelFactory;
use crate::connection::driver::Connector;
use crate::error::{Error, Result};
use crate::helpers::{extract_port_from_uri, redact_uri_password, validate_mongodb_uri};
use crate::models::{ConnectionConfig, DriverOptions, SshOptionsInput, parse_driver_options};
use crate::state::config::ConnectionStore;

use super::AdminCommands;

impl<C: Connector, F: TunnelFactory, S: ConnectionStore> AdminCommands<C, F, S> {
    /// Register a new connection from operator input and persist it.
    ///
    /// `options_json` and `ssh_json` are the raw JSON texts from the form; blank
    /// means "none". A failed save leaves the live connection registered.
    pub async fn add_connection(
        &self,
        name: &str,
        connection_string: &str,
        options_json: &str,
        ssh_json: &str,
    ) -> Result<()> {
        let taken = self.with_store(|store| store.contains(name)) || self.registry.contains(name);
        if taken {
            return Err(Error::NameAlreadyExists(name.to_string()));
        }

        validate_mongodb_uri(connection_string).map_err(Error::InvalidUri)?;
        let driver_options = parse_driver_options(options_json)?;
        let tunnel = SshOptionsInput::parse(ssh_json)?.into_tunnel_config(
            extract_port_from_uri(connection_string),
            &self.settings.local_bind_host,
            self.settings.strict_host_key_checking,
        );

        let config = ConnectionConfig::new(name, connection_string)
            .with_driver_options(driver_options)
            .with_tunnel(tunnel);
        self.registry.add_connection(&config).await?;

        self.with_store(|store| store.set(name, config.to_stored()));
        self.save_store()
    }

    /// Re-register `old_name` as `new_name` with a new connection string.
    ///
    /// SSH settings are carried over from the store; driver options too unless
    /// `driver_options` replaces them.
    pub async fn update_connection(
        &self,
        old_name: &str,
        new_name: &str,
        connection_string: &str,
        driver_options: Option<DriverOptions>,
    ) -> Result<()> {
        let stored = self
            .with_store(|store| store.get(old_name))
            .ok_or_else(|| Error::InvalidConnection(old_name.to_string()))?;

        validate_mongodb_uri(connection_string).map_err(Error::InvalidUri)?;

        if let Some(tunnel) = stored.ssh_options.as_ref().filter(|tunnel| tunnel.enabled) {
            self.registry.broker().open_tunnel(tunnel).await?;
        }

        let config = ConnectionConfig::new(new_name, connection_string)
            .with_driver_options(driver_options.unwrap_or(stored.connection_options))
            .with_tunnel(stored.ssh_options);
        self.registry.add_connection(&config).await?;

        if old_name != new_name {
            self.registry.remove_connection(old_name).await;
        }
        log::info!(
            "Updated connection '{}' -> '{}' ({})",
            old_name,
            new_name,
            redact_uri_password(connection_string)
        );

        self.with_store(|store| {
            store.remove(old_name);
            store.set(new_name, config.to_stored());
        });
        self.save_store()
    }

    /// Forget a connection: drop it from the store and close its client.
    pub async fn remove_connection(&self, name: &str) -> Result<()> {
        self.with_store(|store| store.remove(name));
        self.registry.remove_connection(name).await;
        self.save_store()
    }

    /// Bring up every stored connection. Failures are logged and skipped.
    /// Returns the number of connections that came up.
    pub async fn restore_connections(&self) -> usize {
        let stored: Vec<_> = self.with_store(|store| {
            store.names().into_iter().filter_map(|name| store.get(&name).map(|s| (name, s))).collect()
        });

        let mut restored = 0;
        for (name, stored) in stored {
            let config = ConnectionConfig::from_stored(&name, stored);
            match self.registry.add_connection(&config).await {
                Ok(()) => restored += 1,
                Err(err) => log::error!("Failed to restore connection '{}': {}", name, err),
            }
        }
        log::info!("Restored {} connection(s)", restored);
        restored
    }
}
