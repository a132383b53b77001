//! Process-wide map from connection name to a live client.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::connection::broker::{TunnelBroker, TunnelFactory, TunnelOpener};
use crate::connection::driver::{Connector, DocumentClient, MongoConnector};
use crate::connection::tunnel::SshTunnelFactory;
use crate::connection::types::{Timeouts, with_timeout};
use crate::error::{Error, Result};
use crate::helpers::redact_uri_password;
use crate::models::{ConnectionConfig, DriverOptions};

/// Production registry: official driver, ssh2 tunnels.
pub type MongoRegistry = ConnectionRegistry<MongoConnector, SshTunnelFactory>;

/// A registered connection. Immutable once inserted; replacement swaps the
/// whole handle.
pub struct ConnectionHandle<K, F: TunnelFactory> {
    name: String,
    client: K,
    connection_string: String,
    driver_options: DriverOptions,
    tunnel: TunnelOpener<F>,
    connected_at: DateTime<Utc>,
}

impl<K: DocumentClient, F: TunnelFactory> ConnectionHandle<K, F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &K {
        &self.client
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn redacted_uri(&self) -> String {
        redact_uri_password(&self.connection_string)
    }

    pub fn driver_options(&self) -> &DriverOptions {
        &self.driver_options
    }

    pub fn tunnel(&self) -> &TunnelOpener<F> {
        &self.tunnel
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Run `op` inside a tunnel scope built from this connection's SSH config.
    pub async fn scope<T, Op, Fut>(&self, op: Op) -> Result<T>
    where
        Op: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.tunnel.scope(op).await
    }
}

pub struct ConnectionRegistry<C: Connector, F: TunnelFactory> {
    connector: C,
    broker: Arc<TunnelBroker<F>>,
    timeouts: Timeouts,
    handles: DashMap<String, Arc<ConnectionHandle<C::Client, F>>>,
    /// Serializes add/remove per name across `.await` points.
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MongoRegistry {
    pub fn mongo(timeouts: Timeouts) -> Self {
        Self::new(MongoConnector, SshTunnelFactory, timeouts)
    }
}

impl<C: Connector, F: TunnelFactory> ConnectionRegistry<C, F> {
    pub fn new(connector: C, factory: F, timeouts: Timeouts) -> Self {
        Self {
            connector,
            broker: Arc::new(TunnelBroker::new(factory, timeouts.tunnel)),
            timeouts,
            handles: DashMap::new(),
            name_locks: DashMap::new(),
        }
    }

    pub fn broker(&self) -> &Arc<TunnelBroker<F>> {
        &self.broker
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Connect and register `config`. An existing handle under the same name
    /// is shut down after the new one is in place.
    pub async fn add_connection(&self, config: &ConnectionConfig) -> Result<()> {
        let lock = self.name_lock(&config.name);
        let _guard = lock.lock().await;

        let redacted = redact_uri_password(&config.connection_string);
        log::info!("Connecting '{}' to {}", config.name, redacted);

        let connector = &self.connector;
        let connect_timeout = self.timeouts.connect;
        let client = self
            .broker
            .with_tunnel(config.active_tunnel(), move |_| async move {
                with_timeout(
                    connect_timeout,
                    "connect",
                    connector.connect(&config.connection_string, &config.driver_options),
                )
                .await
                .map_err(Error::into_connect)
            })
            .await
            .inspect_err(|err| log::error!("Failed to connect '{}' ({}): {}", config.name, redacted, err))?;

        let handle = Arc::new(ConnectionHandle {
            name: config.name.clone(),
            client,
            connection_string: config.connection_string.clone(),
            driver_options: config.driver_options.clone(),
            tunnel: TunnelOpener::new(self.broker.clone(), config.tunnel.clone()),
            connected_at: Utc::now(),
        });

        let uri = handle.redacted_uri();
        if let Some(previous) = self.handles.insert(config.name.clone(), handle) {
            log::info!("Replaced connection '{}' ({} -> {})", config.name, previous.redacted_uri(), uri);
            shutdown_client(&previous).await;
        } else {
            log::info!("Connected '{}' ({})", config.name, uri);
        }
        Ok(())
    }

    /// Drop the handle and shut its client down. Absent names are a no-op.
    pub async fn remove_connection(&self, name: &str) {
        let lock = self.name_lock(name);
        let guard = lock.lock().await;

        if let Some((_, handle)) = self.handles.remove(name) {
            shutdown_client(&handle).await;
            log::info!("Removed connection '{}' ({})", name, handle.redacted_uri());
        }

        drop(guard);
        drop(lock);
        // Keep the entry while another add or remove still holds a clone.
        self.name_locks.remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionHandle<C::Client, F>>> {
        self.handles.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn shutdown_all(&self) {
        for name in self.names() {
            self.remove_connection(&name).await;
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks.entry(name.to_string()).or_default().clone()
    }
}

async fn shutdown_client<K: DocumentClient, F: TunnelFactory>(handle: &ConnectionHandle<K, F>) {
    if let Err(err) = handle.client.shutdown().await {
        log::warn!("Closing client for '{}' failed: {}", handle.name, err);
    }
}
