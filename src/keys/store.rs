/// Storage and fetcher capabilities consumed by the key ring
use crate::{
    error::ServerKeyResult,
    keys::{LookupRequests, LookupResults},
};
use async_trait::async_trait;

/// Durable keyed storage for verification keys
///
/// `fetch_keys` returns whatever is stored for the requested identifiers,
/// stale or not; the caller decides what is usable. `store_keys` is an
/// upsert and must leave identifiers outside the batch untouched.
#[async_trait]
pub trait KeyDatabase: Send + Sync {
    /// Look up stored results for the requested identifiers
    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults>;

    /// Insert or replace the given results
    async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()>;
}

/// A strategy for retrieving keys that are not known locally
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Name used in logs and metrics
    fn fetcher_name(&self) -> &str;

    /// Fetch as many of the requested keys as this strategy can find.
    ///
    /// Returning fewer results than requested is not an error.
    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults>;
}
