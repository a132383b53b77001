//! Tunnel scoping: every wrapped call runs inside exactly one open tunnel,
//! and that tunnel is closed exactly once on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::connection::types::with_timeout;
use crate::error::{Error, Result};
use crate::models::SshTunnelConfig;

/// Opens and closes concrete tunnels.
///
/// `close` is the normal exit path and must not block the async worker.
/// `close_now` runs from `Drop` when the surrounding future was cancelled
/// before it could await `close`.
pub trait TunnelFactory: Send + Sync + 'static {
    type Tunnel: Send + 'static;

    fn open(&self, config: &SshTunnelConfig) -> impl Future<Output = Result<Self::Tunnel>> + Send;

    fn close(&self, tunnel: Self::Tunnel) -> impl Future<Output = ()> + Send;

    fn close_now(&self, tunnel: Self::Tunnel);

    /// `host:port` the tunnel actually listens on.
    fn local_endpoint(&self, tunnel: &Self::Tunnel) -> String;
}

pub struct TunnelBroker<F: TunnelFactory> {
    factory: F,
    open_timeout: Duration,
    /// One lock per fixed `local_host:local_port`; scopes on the same
    /// endpoint run one at a time. Entries are kept for the broker's lifetime,
    /// one per distinct configured endpoint.
    endpoint_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<F: TunnelFactory> TunnelBroker<F> {
    pub fn new(factory: F, open_timeout: Duration) -> Self {
        Self { factory, open_timeout, endpoint_locks: DashMap::new() }
    }

    /// Verify the tunnel parameters by opening and immediately closing a tunnel.
    pub async fn open_tunnel(&self, config: &SshTunnelConfig) -> Result<()> {
        let scope = self.enter(config).await?;
        scope.close().await;
        Ok(())
    }

    /// Run `op` inside a tunnel scope. Without an enabled config `op` runs
    /// directly and receives `None`; otherwise it receives the local endpoint.
    pub async fn with_tunnel<T, Op, Fut>(&self, config: Option<&SshTunnelConfig>, op: Op) -> Result<T>
    where
        Op: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(config) = config.filter(|config| config.enabled) else {
            return op(None).await;
        };

        let scope = self.enter(config).await?;
        let result = op(Some(scope.endpoint().to_string())).await;
        scope.close().await;
        result
    }

    /// Acquire a scope that owns an open tunnel until closed or dropped.
    pub async fn enter(&self, config: &SshTunnelConfig) -> Result<TunnelScope<'_, F>> {
        let endpoint_guard = if config.has_fixed_local_port() {
            Some(self.endpoint_lock(&config.local_endpoint()).lock_owned().await)
        } else {
            None
        };

        let tunnel = with_timeout(self.open_timeout, "SSH tunnel setup", self.factory.open(config))
            .await
            .map_err(Error::into_tunnel)?;
        let endpoint = self.factory.local_endpoint(&tunnel);
        log::debug!("SSH tunnel open {} -> {}:{} via {}", endpoint, config.dst_host, config.dst_port, config.host);

        Ok(TunnelScope { factory: &self.factory, tunnel: Some(tunnel), endpoint, _endpoint_guard: endpoint_guard })
    }

    fn endpoint_lock(&self, endpoint: &str) -> Arc<Mutex<()>> {
        self.endpoint_locks.entry(endpoint.to_string()).or_default().clone()
    }
}

/// An open tunnel bound to one operation.
pub struct TunnelScope<'a, F: TunnelFactory> {
    factory: &'a F,
    tunnel: Option<F::Tunnel>,
    endpoint: String,
    // Field order: the endpoint lock is released only after the tunnel is closed.
    _endpoint_guard: Option<OwnedMutexGuard<()>>,
}

impl<F: TunnelFactory> TunnelScope<'_, F> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Close the tunnel, then release the endpoint lock.
    pub async fn close(mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            self.factory.close(tunnel).await;
            log::debug!("SSH tunnel closed {}", self.endpoint);
        }
    }
}

impl<F: TunnelFactory> Drop for TunnelScope<'_, F> {
    fn drop(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            self.factory.close_now(tunnel);
            log::debug!("SSH tunnel closed {} after cancellation", self.endpoint);
        }
    }
}

/// A connection's capability to open tunnel scopes with its own SSH config.
pub struct TunnelOpener<F: TunnelFactory> {
    broker: Arc<TunnelBroker<F>>,
    config: Option<SshTunnelConfig>,
}

impl<F: TunnelFactory> Clone for TunnelOpener<F> {
    fn clone(&self) -> Self {
        Self { broker: self.broker.clone(), config: self.config.clone() }
    }
}

impl<F: TunnelFactory> TunnelOpener<F> {
    pub fn new(broker: Arc<TunnelBroker<F>>, config: Option<SshTunnelConfig>) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> Option<&SshTunnelConfig> {
        self.config.as_ref()
    }

    pub async fn scope<T, Op, Fut>(&self, op: Op) -> Result<T>
    where
        Op: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.broker.with_tunnel(self.config.as_ref(), op).await
    }
}
