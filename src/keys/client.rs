/// HTTP client for a remotely running server key API, with a local cache
use crate::{
    error::{ErrorResponse, ServerKeyError, ServerKeyResult},
    keys::{
        api::{
            InputPublicKeysRequest, InputPublicKeysResponse, QueryPublicKeysRequest,
            QueryPublicKeysResponse, SERVER_KEY_INPUT_PUBLIC_KEY_PATH,
            SERVER_KEY_QUERY_PUBLIC_KEY_PATH,
        },
        KeyDatabase, KeyFetcher, KeyRing, LookupRequests, LookupResults, ServerKeyCache,
        ServerKeyInternalApi, Timestamp,
    },
    metrics,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Remote server key API client.
///
/// Acts as both the key database and the only key fetcher of the key ring
/// it hands out, so every lookup goes through the same cache. The real
/// fetcher waterfall runs on the other end of the API.
#[derive(Clone)]
pub struct HttpServerKeyClient {
    server_key_api_url: String,
    http_client: Client,
    cache: Arc<ServerKeyCache>,
}

impl HttpServerKeyClient {
    /// Create a client for the API at `server_key_api_url`
    pub fn new(server_key_api_url: &str, timeout: Duration) -> ServerKeyResult<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServerKeyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(
            server_key_api_url,
            http_client,
            Arc::new(ServerKeyCache::new()),
        ))
    }

    /// Create a client from an existing HTTP client and cache
    pub fn with_client(
        server_key_api_url: &str,
        http_client: Client,
        cache: Arc<ServerKeyCache>,
    ) -> Self {
        Self {
            server_key_api_url: server_key_api_url.trim_end_matches('/').to_string(),
            http_client,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ServerKeyCache> {
        &self.cache
    }

    /// Cache the keys locally and forward them to the remote API
    pub async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        // The caller already trusts these keys, so cache them straight away
        self.cache
            .store_server_keys(results.iter().map(|(id, res)| (id.clone(), res.clone())))
            .await;

        let request = InputPublicKeysRequest {
            keys: results.clone(),
        };
        let client = self.clone();

        // Forward on a task of its own so a caller giving up does not drop the write
        tokio::spawn(async move { client.input_public_keys(request).await })
            .await
            .map_err(|e| ServerKeyError::Internal(format!("Key input task failed: {}", e)))?
            .map(|_| ())
    }

    /// Answer from the local cache where possible, ask the remote API for the rest
    pub async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        self.fetch_keys_at(requests, Timestamp::now()).await
    }

    pub(crate) async fn fetch_keys_at(
        &self,
        requests: &LookupRequests,
        now: Timestamp,
    ) -> ServerKeyResult<LookupResults> {
        let mut results = LookupResults::new();
        let mut outstanding = LookupRequests::new();

        for (id, valid_at) in requests {
            match self.cache.get_usable_server_key(id, now).await {
                Some(cached) => {
                    results.insert(id.clone(), cached);
                }
                None => {
                    outstanding.insert(id.clone(), *valid_at);
                }
            }
        }

        metrics::record_key_lookups("cache", "hit", results.len());
        metrics::record_key_lookups("cache", "miss", outstanding.len());

        if outstanding.is_empty() {
            return Ok(results);
        }

        debug!(
            "{} keys answered from cache, querying remote for {}",
            results.len(),
            outstanding.len()
        );

        let response = self
            .query_public_keys(QueryPublicKeysRequest {
                requests: outstanding,
            })
            .await?;

        // The remote side is authoritative, cache whatever it returned
        self.cache
            .store_server_keys(
                response
                    .results
                    .iter()
                    .map(|(id, res)| (id.clone(), res.clone())),
            )
            .await;

        let missing = response.missing;
        results.extend(response.results);

        if missing.is_empty() {
            Ok(results)
        } else {
            Err(ServerKeyError::keys_missing(results, missing))
        }
    }

    async fn post_json<Req, Res>(&self, path: &str, request: &Req) -> ServerKeyResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let url = format!("{}{}", self.server_key_api_url, path);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to reach server key API at {}: {}", url, e);
                ServerKeyError::Transport(format!("Failed to reach {}: {}", url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorResponse>().await {
                Ok(body) => format!("{}: {}", body.error, body.message),
                Err(_) => status.to_string(),
            };
            warn!("Server key API {} returned {}: {}", path, status, detail);
            return Err(ServerKeyError::Transport(format!(
                "{} returned {}: {}",
                path, status, detail
            )));
        }

        response.json::<Res>().await.map_err(|e| {
            ServerKeyError::Transport(format!("Invalid response from {}: {}", path, e))
        })
    }
}

#[async_trait]
impl ServerKeyInternalApi for HttpServerKeyClient {
    fn key_ring(&self) -> KeyRing {
        // This client is both the key database and the key fetcher. That keeps
        // the remote side in charge of the real fetchers while every lookup on
        // this side shares one cache.
        KeyRing::new(Arc::new(self.clone()), vec![Arc::new(self.clone())])
    }

    async fn input_public_keys(
        &self,
        request: InputPublicKeysRequest,
    ) -> ServerKeyResult<InputPublicKeysResponse> {
        self.post_json(SERVER_KEY_INPUT_PUBLIC_KEY_PATH, &request).await
    }

    async fn query_public_keys(
        &self,
        request: QueryPublicKeysRequest,
    ) -> ServerKeyResult<QueryPublicKeysResponse> {
        self.post_json(SERVER_KEY_QUERY_PUBLIC_KEY_PATH, &request).await
    }
}

#[async_trait]
impl KeyDatabase for HttpServerKeyClient {
    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        HttpServerKeyClient::fetch_keys(self, requests).await
    }

    async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        HttpServerKeyClient::store_keys(self, results).await
    }
}

#[async_trait]
impl KeyFetcher for HttpServerKeyClient {
    fn fetcher_name(&self) -> &str {
        "httpServerKeyInternalAPI"
    }

    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        HttpServerKeyClient::fetch_keys(self, requests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::testutil::{key, lookup, requests_for};

    fn unreachable_client() -> HttpServerKeyClient {
        // Nothing listens on port 9; any remote call fails fast
        HttpServerKeyClient::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_remote_call() {
        let client = unreachable_client();
        let id = key("cached.example");
        client
            .cache()
            .store_server_key(id.clone(), lookup(1_000, None))
            .await;

        // Would fail with a transport error if it reached the network
        let fetched = client
            .fetch_keys_at(&requests_for(&[id.clone()], 500), Timestamp(500))
            .await
            .unwrap();

        assert_eq!(fetched.get(&id), Some(&lookup(1_000, None)));
    }

    #[tokio::test]
    async fn test_stale_cache_entry_goes_remote() {
        let client = unreachable_client();
        let id = key("stale.example");
        client
            .cache()
            .store_server_key(id.clone(), lookup(100, None))
            .await;

        let err = client
            .fetch_keys_at(&requests_for(&[id], 150), Timestamp(150))
            .await
            .unwrap_err();

        assert!(matches!(err, ServerKeyError::Transport(_)));
    }

    #[tokio::test]
    async fn test_store_caches_even_when_remote_fails() {
        let client = unreachable_client();
        let id = key("pushed.example");
        let mut results = LookupResults::new();
        results.insert(id.clone(), lookup(1_000, None));

        let outcome = client.store_keys(&results).await;

        assert!(matches!(outcome, Err(ServerKeyError::Transport(_))));
        assert_eq!(
            client.cache().get_server_key(&id).await,
            Some(lookup(1_000, None))
        );
    }

    #[test]
    fn test_key_ring_uses_client_for_both_roles() {
        let client = unreachable_client();
        let ring = client.key_ring();

        assert_eq!(ring.fetchers().len(), 1);
        assert_eq!(ring.fetchers()[0].fetcher_name(), "httpServerKeyInternalAPI");
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = unreachable_client();
        assert_eq!(client.server_key_api_url, "http://127.0.0.1:9");
    }
}
