//! Operator-facing commands: connection configuration plus document operations.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::broker::TunnelFactory;
use crate::connection::driver::Connector;
use crate::connection::ops::DocumentOperationExecutor;
use crate::connection::registry::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::state::config::ConnectionStore;
use crate::state::settings::AppSettings;

mod connections;

/// Ties the live registry to the persisted connection store.
pub struct AdminCommands<C: Connector, F: TunnelFactory, S: ConnectionStore> {
    registry: Arc<ConnectionRegistry<C, F>>,
    store: Mutex<S>,
    settings: AppSettings,
}

impl<C: Connector, F: TunnelFactory, S: ConnectionStore> AdminCommands<C, F, S> {
    pub fn new(registry: Arc<ConnectionRegistry<C, F>>, store: S, settings: AppSettings) -> Self {
        Self { registry, store: Mutex::new(store), settings }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C, F>> {
        &self.registry
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn documents(&self) -> DocumentOperationExecutor<'_, C, F> {
        DocumentOperationExecutor::new(&self.registry)
    }

    /// Run `f` against the store. The lock is never held across an await.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut self.store.lock())
    }

    fn save_store(&self) -> Result<()> {
        self.store.lock().save().map_err(|err| Error::ConfigSave(format!("{err:#}")))
    }
}
