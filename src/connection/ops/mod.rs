//! Document operations executed inside tunnel scopes.

pub mod documents;
pub mod id_resolver;

pub use documents::DocumentOperationExecutor;
pub use id_resolver::candidate_ids;
