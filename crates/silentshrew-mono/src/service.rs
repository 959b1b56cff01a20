//! Thin read path over the repository and the chain source.

use std::sync::Arc;

use silentshrew_sync::{ChainSource, ScalarRepository, SyncResult};

pub struct ScalarService {
    repo: Arc<dyn ScalarRepository>,
    chain: Arc<dyn ChainSource>,
}

impl ScalarService {
    pub fn new(repo: Arc<dyn ScalarRepository>, chain: Arc<dyn ChainSource>) -> Self {
        Self { repo, chain }
    }

    /// The indexed tip, not the chain tip.
    pub async fn chain_tip(&self) -> SyncResult<u32> {
        Ok(self.repo.latest_height().await? as u32)
    }

    pub async fn scalars_by_height(&self, height: u32) -> SyncResult<Vec<String>> {
        Ok(self
            .repo
            .get_by_height(height as i32)
            .await?
            .iter()
            .map(|scalar| hex::encode(&scalar.scalar))
            .collect())
    }

    pub async fn block_filter(&self, height: u32) -> SyncResult<(String, String)> {
        self.chain.get_block_filter_by_height(height as i32).await
    }
}
