//! Connection lifecycle and tunnel-scoped operations.
//!
//! - `registry`: live clients keyed by connection name
//! - `broker`: tunnel scopes with guaranteed close
//! - `tunnel`: ssh2 local port forwarding
//! - `driver`: the seam to the native MongoDB client
//! - `ops`: document mutations

pub mod broker;
pub mod driver;
pub mod ops;
pub mod registry;
pub mod tunnel;
pub mod types;

pub use broker::{TunnelBroker, TunnelFactory, TunnelOpener, TunnelScope};
pub use driver::{Connector, DocumentClient, MongoClient, MongoConnector, SaveOutcome};
pub use ops::DocumentOperationExecutor;
pub use registry::{ConnectionHandle, ConnectionRegistry, MongoRegistry};
pub use tunnel::{SshTunnelFactory, SshTunnelHandle};
pub use types::{DocumentTarget, OperationResponse, OperationResult, Timeouts};
