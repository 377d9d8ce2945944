/// Key Ring - orchestrates key database lookups and fetcher fallback
use crate::{
    error::{ServerKeyError, ServerKeyResult},
    keys::{KeyDatabase, KeyFetcher, KeyIdentifier, LookupRequests, LookupResults, Timestamp},
    metrics,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The key database plus an ordered list of fetchers.
///
/// Constructed once at startup and shared by every caller. Cloning is cheap
/// and clones share the same database and fetchers.
#[derive(Clone)]
pub struct KeyRing {
    database: Arc<dyn KeyDatabase>,
    fetchers: Vec<Arc<dyn KeyFetcher>>,
}

impl KeyRing {
    /// Create a key ring. Fetchers are consulted in the order given.
    pub fn new(database: Arc<dyn KeyDatabase>, fetchers: Vec<Arc<dyn KeyFetcher>>) -> Self {
        Self { database, fetchers }
    }

    pub fn database(&self) -> &Arc<dyn KeyDatabase> {
        &self.database
    }

    pub fn fetchers(&self) -> &[Arc<dyn KeyFetcher>] {
        &self.fetchers
    }

    /// Resolve a batch of keys
    ///
    /// Resolution order:
    /// 1. Key database, skipping stale entries
    /// 2. Each fetcher in turn, asked only for what is still outstanding
    /// 3. Fetched keys are persisted as soon as each fetcher returns
    ///
    /// Returns [`ServerKeyError::KeysMissing`] with the partial batch if
    /// anything is left unresolved.
    pub async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        self.fetch_keys_at(requests, Timestamp::now()).await
    }

    pub(crate) async fn fetch_keys_at(
        &self,
        requests: &LookupRequests,
        now: Timestamp,
    ) -> ServerKeyResult<LookupResults> {
        let mut outstanding = requests.clone();
        let mut results = LookupResults::new();

        if outstanding.is_empty() {
            return Ok(results);
        }

        // Check the key database first (fast path)
        let stored = match self.database.fetch_keys(&outstanding).await {
            Ok(stored) => Some(stored),
            // A database fronting another key service may answer only part of the batch
            Err(ServerKeyError::KeysMissing(partial)) => Some(partial.resolved),
            Err(e) => {
                warn!("Key database lookup failed, falling back to fetchers: {}", e);
                None
            }
        };

        if let Some(stored) = stored {
            let mut stale = 0;
            for (id, result) in stored {
                if !outstanding.contains_key(&id) {
                    continue;
                }
                if !result.is_usable_at(now) {
                    debug!("Stored key {} is stale, re-fetching", id);
                    stale += 1;
                    continue;
                }
                outstanding.remove(&id);
                results.insert(id, result);
            }
            metrics::record_key_lookups("store", "hit", results.len());
            metrics::record_key_lookups("store", "stale", stale);
            metrics::record_key_lookups("store", "miss", outstanding.len());
        }

        for fetcher in &self.fetchers {
            if outstanding.is_empty() {
                break;
            }

            let name = fetcher.fetcher_name();
            let started = Instant::now();
            let fetched = match fetcher.fetch_keys(&outstanding).await {
                Ok(fetched) => {
                    metrics::record_fetcher_request(name, true, started.elapsed().as_secs_f64());
                    fetched
                }
                Err(ServerKeyError::KeysMissing(partial)) => {
                    metrics::record_fetcher_request(name, true, started.elapsed().as_secs_f64());
                    partial.resolved
                }
                Err(e) => {
                    metrics::record_fetcher_request(name, false, started.elapsed().as_secs_f64());
                    warn!(
                        "Key fetcher {} failed for {} keys: {}",
                        name,
                        outstanding.len(),
                        e
                    );
                    continue;
                }
            };

            // Only keep answers to questions we actually asked
            let fetched: LookupResults = fetched
                .into_iter()
                .filter(|(id, _)| outstanding.contains_key(id))
                .collect();

            debug!("Key fetcher {} returned {} keys", name, fetched.len());
            metrics::record_key_lookups("fetcher", "hit", fetched.len());

            if fetched.is_empty() {
                continue;
            }

            for id in fetched.keys() {
                outstanding.remove(id);
            }

            persist_detached(Arc::clone(&self.database), fetched.clone()).await?;
            results.extend(fetched);
        }

        if !outstanding.is_empty() {
            let mut missing: Vec<KeyIdentifier> = outstanding.into_keys().collect();
            missing.sort();
            for id in &missing {
                debug!("No key source could resolve {}", id);
            }
            metrics::record_unresolved_keys(missing.len());
            return Err(ServerKeyError::keys_missing(results, missing));
        }

        Ok(results)
    }

    /// Store keys that were obtained elsewhere, e.g. embedded in a received event
    pub async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        persist_detached(Arc::clone(&self.database), results.clone()).await
    }
}

/// Write keys on a task of its own.
///
/// Dropping the returned future only stops the caller waiting; the write
/// still runs to completion.
pub(crate) async fn persist_detached(
    database: Arc<dyn KeyDatabase>,
    results: LookupResults,
) -> ServerKeyResult<()> {
    let handle = tokio::spawn(async move {
        let count = results.len();
        let outcome = database.store_keys(&results).await;
        if outcome.is_ok() {
            metrics::record_keys_stored(count);
        }
        outcome
    });

    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ ServerKeyError::StorePersistence(_))) => Err(e),
        Ok(Err(e)) => Err(ServerKeyError::StorePersistence(e.to_string())),
        Err(e) => Err(ServerKeyError::StorePersistence(format!(
            "Key persistence task failed: {}",
            e
        ))),
    }
}
