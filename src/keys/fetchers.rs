/// Key fetchers that retrieve server keys over federation
///
/// - [`DirectKeyFetcher`] asks each owning server for its own keys
/// - [`PerspectiveKeyFetcher`] asks a trusted notary server on their behalf
///
/// Signatures on the returned key documents are checked by the verification
/// layer that consumes the key ring, not here.
use crate::{
    error::{ServerKeyError, ServerKeyResult},
    keys::{
        KeyFetcher, KeyIdentifier, KeyLookupResult, LookupRequests, LookupResults, Timestamp,
        VerifyKey,
    },
};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Path a server publishes its own keys at
pub const SERVER_KEYS_PATH: &str = "/_matrix/key/v2/server";

/// Path a notary answers batched key queries at
pub const KEY_QUERY_PATH: &str = "/_matrix/key/v2/query";

/// A server's published key document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeys {
    pub server_name: String,
    #[serde(default)]
    pub verify_keys: HashMap<String, CurrentVerifyKey>,
    #[serde(default)]
    pub old_verify_keys: HashMap<String, OldVerifyKey>,
    pub valid_until_ts: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentVerifyKey {
    pub key: VerifyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub key: VerifyKey,
    pub expired_ts: Timestamp,
}

impl ServerKeys {
    /// Results for the requested identifiers that this document answers
    pub fn lookup_results(&self, requests: &LookupRequests) -> LookupResults {
        let mut results = LookupResults::new();

        for id in requests.keys() {
            if id.server_name != self.server_name {
                continue;
            }

            if let Some(current) = self.verify_keys.get(&id.key_id) {
                results.insert(
                    id.clone(),
                    KeyLookupResult {
                        verify_key: current.key.clone(),
                        valid_until_ts: self.valid_until_ts,
                        expired_ts: None,
                    },
                );
            } else if let Some(old) = self.old_verify_keys.get(&id.key_id) {
                results.insert(
                    id.clone(),
                    KeyLookupResult {
                        verify_key: old.key.clone(),
                        valid_until_ts: old.expired_ts,
                        expired_ts: Some(old.expired_ts),
                    },
                );
            }
        }

        results
    }
}

/// Merge `incoming` into `results`, keeping the longer-lived answer on conflict
fn merge_results(results: &mut LookupResults, incoming: LookupResults) {
    for (id, result) in incoming {
        match results.get(&id) {
            Some(existing) if existing.valid_until_ts >= result.valid_until_ts => {}
            _ => {
                results.insert(id, result);
            }
        }
    }
}

/// Group requests by owning server
fn requests_by_server(requests: &LookupRequests) -> BTreeMap<&str, LookupRequests> {
    let mut grouped: BTreeMap<&str, LookupRequests> = BTreeMap::new();
    for (id, valid_at) in requests {
        grouped
            .entry(id.server_name.as_str())
            .or_default()
            .insert(id.clone(), *valid_at);
    }
    grouped
}

/// Fetches keys straight from the server that owns them
#[derive(Clone)]
pub struct DirectKeyFetcher {
    http_client: Client,
    scheme: String,
}

impl DirectKeyFetcher {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            scheme: "https".to_string(),
        }
    }

    /// Use another URL scheme, e.g. plain `http` for local test servers
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    fn server_keys_url(&self, server_name: &str) -> String {
        format!("{}://{}{}", self.scheme, server_name, SERVER_KEYS_PATH)
    }

    async fn fetch_server_keys(&self, server_name: &str) -> ServerKeyResult<ServerKeys> {
        let url = self.server_keys_url(server_name);
        debug!("Fetching server keys from {}", url);

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            self.fetch_error(format!("Failed to fetch keys from {}: {}", server_name, e))
        })?;

        if !response.status().is_success() {
            return Err(self.fetch_error(format!(
                "{} returned error: {}",
                server_name,
                response.status()
            )));
        }

        let keys: ServerKeys = response.json().await.map_err(|e| {
            self.fetch_error(format!("Invalid key document from {}: {}", server_name, e))
        })?;

        if keys.server_name != server_name {
            return Err(self.fetch_error(format!(
                "Key document for {} claims to be from {}",
                server_name, keys.server_name
            )));
        }

        Ok(keys)
    }

    fn fetch_error(&self, message: String) -> ServerKeyError {
        ServerKeyError::Fetcher {
            fetcher: self.fetcher_name().to_string(),
            message,
        }
    }
}

#[async_trait]
impl KeyFetcher for DirectKeyFetcher {
    fn fetcher_name(&self) -> &str {
        "DirectKeyFetcher"
    }

    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        let grouped = requests_by_server(requests);
        let server_count = grouped.len();

        let responses = join_all(grouped.into_iter().map(|(server_name, server_requests)| async move {
            let outcome = self.fetch_server_keys(server_name).await;
            (server_name, server_requests, outcome)
        }))
        .await;

        let mut results = LookupResults::new();
        let mut failures = 0;

        for (server_name, server_requests, outcome) in responses {
            match outcome {
                Ok(keys) => merge_results(&mut results, keys.lookup_results(&server_requests)),
                Err(e) => {
                    warn!("Direct key fetch from {} failed: {}", server_name, e);
                    failures += 1;
                }
            }
        }

        if server_count > 0 && failures == server_count {
            return Err(self.fetch_error(format!("All {} servers failed", server_count)));
        }

        Ok(results)
    }
}

/// Per-key query criteria sent to a notary
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyCriteria {
    minimum_valid_until_ts: Timestamp,
}

#[derive(Debug, Serialize)]
struct KeyQueryRequest {
    server_keys: BTreeMap<String, BTreeMap<String, KeyCriteria>>,
}

#[derive(Debug, Deserialize)]
struct KeyQueryResponse {
    #[serde(default)]
    server_keys: Vec<ServerKeys>,
}

/// Fetches keys through a notary server that vouches for other servers' keys
#[derive(Clone)]
pub struct PerspectiveKeyFetcher {
    name: String,
    base_url: String,
    http_client: Client,
}

impl PerspectiveKeyFetcher {
    /// `base_url` is the notary's base URL, e.g. `https://matrix.org`
    pub fn new(base_url: &str, http_client: Client) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            name: format!("PerspectiveKeyFetcher:{}", base_url),
            base_url,
            http_client,
        }
    }

    fn query_body(requests: &LookupRequests) -> KeyQueryRequest {
        let mut server_keys: BTreeMap<String, BTreeMap<String, KeyCriteria>> = BTreeMap::new();
        for (KeyIdentifier { server_name, key_id }, valid_at) in requests {
            server_keys.entry(server_name.clone()).or_default().insert(
                key_id.clone(),
                KeyCriteria {
                    minimum_valid_until_ts: *valid_at,
                },
            );
        }
        KeyQueryRequest { server_keys }
    }

    fn fetch_error(&self, message: String) -> ServerKeyError {
        ServerKeyError::Fetcher {
            fetcher: self.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl KeyFetcher for PerspectiveKeyFetcher {
    fn fetcher_name(&self) -> &str {
        &self.name
    }

    async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        let url = format!("{}{}", self.base_url, KEY_QUERY_PATH);
        debug!("Querying notary {} for {} keys", url, requests.len());

        let response = self
            .http_client
            .post(&url)
            .json(&Self::query_body(requests))
            .send()
            .await
            .map_err(|e| self.fetch_error(format!("Failed to query notary: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.fetch_error(format!("Notary returned error: {}", response.status())));
        }

        let body: KeyQueryResponse = response
            .json()
            .await
            .map_err(|e| self.fetch_error(format!("Invalid notary response: {}", e)))?;

        let mut results = LookupResults::new();
        for keys in body.server_keys {
            merge_results(&mut results, keys.lookup_results(requests));
        }

        Ok(results)
    }
}
