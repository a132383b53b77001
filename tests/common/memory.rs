//! In-memory stand-ins for the driver, the tunnel factory and the config store.
//!
//! The fakes count every connect, shutdown, driver call and tunnel open/close
//! so tests can check lifecycle balance without Docker.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use mango_admin::connection::{
    ConnectionRegistry, Connector, DocumentClient, DocumentOperationExecutor, SaveOutcome,
    Timeouts, TunnelFactory,
};
use mango_admin::error::{Error, Result};
use mango_admin::models::{DriverOptions, SshAuth, SshTunnelConfig, StoredConnection};
use mango_admin::state::ConnectionStore;
use mongodb::bson::{Bson, Document, oid::ObjectId};
use parking_lot::Mutex;

// =============================================================================
// Driver
// =============================================================================

type Namespace = (String, String);

#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<Namespace, Vec<Document>>>,
    pub connects: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub driver_calls: AtomicUsize,
    pub calls_outside_tunnel: AtomicUsize,
    fail_connect: AtomicBool,
    fail_calls: AtomicBool,
    call_delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
    tunnel_probe: Mutex<Option<Arc<TunnelCounts>>>,
}

impl MemoryBackend {
    pub fn seed(&self, db: &str, coll: &str, documents: Vec<Document>) {
        self.collections
            .lock()
            .entry((db.to_string(), coll.to_string()))
            .or_default()
            .extend(documents);
    }

    pub fn documents(&self, db: &str, coll: &str) -> Vec<Document> {
        self.collections.lock().get(&(db.to_string(), coll.to_string())).cloned().unwrap_or_default()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn delay_calls(&self, delay: Option<Duration>) {
        *self.call_delay.lock() = delay;
    }

    pub fn delay_connect(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    /// Count driver calls that happen while no tunnel from `counts` is open.
    pub fn require_tunnel(&self, counts: Arc<TunnelCounts>) {
        *self.tunnel_probe.lock() = Some(counts);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn driver_calls(&self) -> usize {
        self.driver_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<()> {
        self.driver_calls.fetch_add(1, Ordering::SeqCst);
        let probe = self.tunnel_probe.lock().clone();
        if let Some(counts) = probe
            && counts.open_now() == 0
        {
            self.calls_outside_tunnel.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.call_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected driver failure")));
        }
        Ok(())
    }

    fn with_collection<T>(&self, db: &str, coll: &str, f: impl FnOnce(&mut Vec<Document>) -> T) -> T {
        let mut collections = self.collections.lock();
        f(collections.entry((db.to_string(), coll.to_string())).or_default())
    }
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    pub backend: Arc<MemoryBackend>,
}

impl Connector for MemoryConnector {
    type Client = MemoryClient;

    async fn connect(&self, connection_string: &str, options: &DriverOptions) -> Result<MemoryClient> {
        if !connection_string.starts_with("mongodb") {
            return Err(Error::InvalidUri(connection_string.to_string()));
        }
        let delay = *self.backend.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("connection refused")));
        }
        let serial = self.backend.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryClient {
            backend: self.backend.clone(),
            serial,
            connection_string: connection_string.to_string(),
            options: options.clone(),
        })
    }
}

pub struct MemoryClient {
    backend: Arc<MemoryBackend>,
    pub serial: usize,
    pub connection_string: String,
    pub options: DriverOptions,
}

fn same_id(doc: &Document, id: &Bson) -> bool {
    doc.get("_id") == Some(id)
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

impl DocumentClient for MemoryClient {
    async fn insert_many(&self, db: &str, coll: &str, documents: Vec<Document>) -> Result<Vec<Bson>> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            let mut ids = Vec::with_capacity(documents.len());
            for mut document in documents {
                let id = match document.get("_id") {
                    Some(id) => id.clone(),
                    None => {
                        let id = Bson::ObjectId(ObjectId::new());
                        document.insert("_id", id.clone());
                        id
                    }
                };
                if stored.iter().any(|existing| same_id(existing, &id)) {
                    return Err(Error::Io(std::io::Error::other("E11000 duplicate key")));
                }
                stored.push(document);
                ids.push(id);
            }
            Ok(ids)
        })
    }

    async fn save(&self, db: &str, coll: &str, mut document: Document) -> Result<SaveOutcome> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            let id = match document.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    document.insert("_id", id.clone());
                    id
                }
            };
            match stored.iter_mut().find(|existing| same_id(existing, &id)) {
                Some(existing) => *existing = document,
                None => stored.push(document),
            }
            Ok(SaveOutcome { id, affected: 1 })
        })
    }

    async fn replace_by_id(&self, db: &str, coll: &str, id: Bson, replacement: Document) -> Result<u64> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            match stored.iter_mut().find(|existing| same_id(existing, &id)) {
                Some(existing) if *existing != replacement => {
                    *existing = replacement;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    async fn delete_many(&self, db: &str, coll: &str, filter: Document) -> Result<u64> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            let before = stored.len();
            stored.retain(|doc| !matches_filter(doc, &filter));
            Ok((before - stored.len()) as u64)
        })
    }

    async fn find_id(&self, db: &str, coll: &str, id: Bson) -> Result<Option<Bson>> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            Ok(stored.iter().find(|doc| same_id(doc, &id)).and_then(|doc| doc.get("_id").cloned()))
        })
    }

    async fn delete_by_id(&self, db: &str, coll: &str, id: Bson) -> Result<u64> {
        self.backend.before_call().await?;
        self.backend.with_collection(db, coll, |stored| {
            match stored.iter().position(|doc| same_id(doc, &id)) {
                Some(index) => {
                    stored.remove(index);
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.backend.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Tunnels
// =============================================================================

#[derive(Default)]
pub struct TunnelCounts {
    opens: AtomicUsize,
    closes: AtomicUsize,
    open_now: AtomicUsize,
    max_open: AtomicUsize,
    next_port: AtomicU64,
    fail_open: AtomicBool,
}

impl TunnelCounts {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

pub struct CountedTunnel {
    pub local_endpoint: String,
}

#[derive(Clone, Default)]
pub struct CountingTunnelFactory {
    pub counts: Arc<TunnelCounts>,
}

impl TunnelFactory for CountingTunnelFactory {
    type Tunnel = CountedTunnel;

    async fn open(&self, config: &SshTunnelConfig) -> Result<CountedTunnel> {
        if self.counts.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("ssh: connection refused")));
        }
        let port = if config.local_port == 0 {
            40_000 + self.counts.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            u64::from(config.local_port)
        };
        self.counts.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.counts.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(CountedTunnel { local_endpoint: format!("{}:{}", config.local_host, port) })
    }

    async fn close(&self, tunnel: CountedTunnel) {
        tokio::task::yield_now().await;
        self.close_now(tunnel);
    }

    fn close_now(&self, _tunnel: CountedTunnel) {
        self.counts.open_now.fetch_sub(1, Ordering::SeqCst);
        self.counts.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn local_endpoint(&self, tunnel: &CountedTunnel) -> String {
        tunnel.local_endpoint.clone()
    }
}

pub fn tunnel_config(local_port: u16) -> SshTunnelConfig {
    SshTunnelConfig {
        enabled: true,
        host: "bastion.test".to_string(),
        username: "ops".to_string(),
        port: 22,
        dst_host: "127.0.0.1".to_string(),
        dst_port: 27017,
        local_host: "127.0.0.1".to_string(),
        local_port,
        auth: SshAuth::Password { password: "secret".to_string() },
        strict_host_key_checking: false,
    }
}

// =============================================================================
// Config store
// =============================================================================

#[derive(Default)]
struct StoreState {
    entries: BTreeMap<String, StoredConnection>,
    saved: BTreeMap<String, StoredConnection>,
    saves: usize,
    fail_save: bool,
}

/// Cloneable so a test keeps a view of the store it hands to `AdminCommands`.
#[derive(Clone, Default)]
pub struct MemoryConnectionStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryConnectionStore {
    pub fn fail_save(&self, fail: bool) {
        self.state.lock().fail_save = fail;
    }

    pub fn saves(&self) -> usize {
        self.state.lock().saves
    }

    /// What the last successful save persisted.
    pub fn persisted(&self) -> BTreeMap<String, StoredConnection> {
        self.state.lock().saved.clone()
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn get(&self, name: &str) -> Option<StoredConnection> {
        self.state.lock().entries.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: StoredConnection) {
        self.state.lock().entries.insert(name.to_string(), value);
    }

    fn remove(&mut self, name: &str) -> Option<StoredConnection> {
        self.state.lock().entries.remove(name)
    }

    fn names(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    fn save(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_save {
            anyhow::bail!("disk full");
        }
        state.saved = state.entries.clone();
        state.saves += 1;
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub type MemoryRegistry = ConnectionRegistry<MemoryConnector, CountingTunnelFactory>;

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub tunnels: Arc<TunnelCounts>,
    pub registry: Arc<MemoryRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeouts(Timeouts::default())
    }

    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        let connector = MemoryConnector::default();
        let factory = CountingTunnelFactory::default();
        Self {
            backend: connector.backend.clone(),
            tunnels: factory.counts.clone(),
            registry: Arc::new(ConnectionRegistry::new(connector, factory, timeouts)),
        }
    }

    pub fn executor(&self) -> DocumentOperationExecutor<'_, MemoryConnector, CountingTunnelFactory> {
        DocumentOperationExecutor::new(&self.registry)
    }
}
