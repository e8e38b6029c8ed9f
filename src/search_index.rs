//! Search index collaborator.
//!
//! The core only deletes from the index (indexing itself hangs off the
//! completion topic, outside this crate). Deletion is best-effort: callers
//! log failures and carry on with the rest of the cascade.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn delete_by_file_hash(&self, file_hash: &str) -> Result<()>;
}

/// Wiring for deployments without a search backend, and for tests.
pub struct NoopSearchIndex;

#[async_trait]
impl SearchIndex for NoopSearchIndex {
    async fn delete_by_file_hash(&self, file_hash: &str) -> Result<()> {
        debug!(file_hash, "noop search index delete");
        Ok(())
    }
}
