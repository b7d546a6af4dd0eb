use crate::model::MentionId;
use crate::store::CacheStore;
use crate::Error;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-account watermark: the highest mention id already published.
///
/// Only the producer writes it, so a read-compare-write is enough to keep it
/// monotonic. It has no TTL; losing it (cache flush) means "no prior history".
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn CacheStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    fn key(account_id: &str) -> String {
        format!("cursor:{account_id}")
    }

    pub async fn load(&self, account_id: &str) -> Result<Option<MentionId>, Error> {
        match self.store.get(&Self::key(account_id)).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Move the cursor forward to `id`. A smaller or equal id leaves it untouched.
    /// Returns the cursor value after the call.
    pub async fn advance(&self, account_id: &str, id: MentionId) -> Result<MentionId, Error> {
        let current = self.load(account_id).await?;
        if let Some(current) = current {
            if current >= id {
                debug!(account = account_id, %current, candidate = %id, "Cursor already ahead");
                return Ok(current);
            }
        }

        self.store
            .set(&Self::key(account_id), &id.to_string(), None)
            .await?;
        info!(account = account_id, previous = ?current, cursor = %id, "Cursor advanced");
        Ok(id)
    }
}
