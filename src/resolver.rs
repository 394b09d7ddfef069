//! Hydrates winning candidates with their content and metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::chunk::ChunkDetail;
use crate::error::StoreError;
use crate::scorer::ScoredCandidate;
use crate::store::ChunkStore;

/// Issues one batched point read for exactly the winning ids.
pub struct DetailResolver {
    store: Arc<dyn ChunkStore>,
    read_timeout: Duration,
}

impl DetailResolver {
    pub fn new(store: Arc<dyn ChunkStore>, read_timeout: Duration) -> Self {
        Self {
            store,
            read_timeout,
        }
    }

    /// Fetches details for `winners`. Ids deleted since the candidate list
    /// was cached are absent from the result and logged, not raised.
    pub async fn resolve(
        &self,
        winners: &[ScoredCandidate],
    ) -> Result<HashMap<String, ChunkDetail>, StoreError> {
        if winners.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<String> = winners.iter().map(|w| w.id.clone()).collect();
        let details = tokio::time::timeout(self.read_timeout, self.store.fetch_details(&ids))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "fetch_details",
                timeout: self.read_timeout,
            })??;
        for id in ids.iter().filter(|id| !details.contains_key(id.as_str())) {
            warn!(id = %id, "winning chunk missing at hydration; omitted");
        }
        Ok(details)
    }
}
