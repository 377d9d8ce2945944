/// In-memory server key cache used in front of the remote key service
use crate::keys::{KeyIdentifier, KeyLookupResult, Timestamp};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-identifier cache of lookup results.
///
/// Entries are only ever replaced, never evicted. Staleness is decided on
/// read with [`KeyLookupResult::is_usable_at`].
#[derive(Default)]
pub struct ServerKeyCache {
    entries: RwLock<HashMap<KeyIdentifier, KeyLookupResult>>,
}

impl ServerKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached result, whether or not it is still usable
    pub async fn get_server_key(&self, id: &KeyIdentifier) -> Option<KeyLookupResult> {
        self.entries.read().await.get(id).cloned()
    }

    /// Get a cached result only if it may be served at `now`
    pub async fn get_usable_server_key(
        &self,
        id: &KeyIdentifier,
        now: Timestamp,
    ) -> Option<KeyLookupResult> {
        self.get_server_key(id)
            .await
            .filter(|result| result.is_usable_at(now))
    }

    /// Insert or replace a result
    pub async fn store_server_key(&self, id: KeyIdentifier, result: KeyLookupResult) {
        self.entries.write().await.insert(id, result);
    }

    /// Insert or replace many results under one lock
    pub async fn store_server_keys<I>(&self, results: I)
    where
        I: IntoIterator<Item = (KeyIdentifier, KeyLookupResult)>,
    {
        let mut entries = self.entries.write().await;
        for (id, result) in results {
            entries.insert(id, result);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
