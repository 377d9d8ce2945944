/// Internal server key API
///
/// The same interface is served in-process by [`ServerKeyApi`] and over
/// HTTP by [`crate::keys::HttpServerKeyClient`].
use crate::{
    error::{ServerKeyError, ServerKeyResult},
    keys::{KeyIdentifier, KeyRing, LookupRequests, LookupResults},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// HTTP path for storing keys
pub const SERVER_KEY_INPUT_PUBLIC_KEY_PATH: &str = "/serverkeyapi/inputPublicKey";

/// HTTP path for querying keys
pub const SERVER_KEY_QUERY_PUBLIC_KEY_PATH: &str = "/serverkeyapi/queryPublicKey";

/// Keys to store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputPublicKeysRequest {
    pub keys: LookupResults,
}

/// Acknowledgement of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputPublicKeysResponse {}

/// Keys to resolve, each with the instant it must be valid at
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPublicKeysRequest {
    pub requests: LookupRequests,
}

/// Everything that could be resolved, plus whatever could not
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPublicKeysResponse {
    pub results: LookupResults,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<KeyIdentifier>,
}

impl QueryPublicKeysResponse {
    /// Convert back into the in-process result shape
    pub fn into_result(self) -> ServerKeyResult<LookupResults> {
        if self.missing.is_empty() {
            Ok(self.results)
        } else {
            Err(ServerKeyError::keys_missing(self.results, self.missing))
        }
    }
}

/// Operations exposed by the server key component
#[async_trait]
pub trait ServerKeyInternalApi: Send + Sync {
    /// A key ring suitable for verifying signatures through this API
    fn key_ring(&self) -> KeyRing;

    /// Store keys, e.g. ones embedded in received events
    async fn input_public_keys(
        &self,
        request: InputPublicKeysRequest,
    ) -> ServerKeyResult<InputPublicKeysResponse>;

    /// Resolve keys. Unresolved identifiers are listed in `missing`
    /// rather than failing the whole call.
    async fn query_public_keys(
        &self,
        request: QueryPublicKeysRequest,
    ) -> ServerKeyResult<QueryPublicKeysResponse>;
}

/// In-process implementation backed by the real key database and fetchers
#[derive(Clone)]
pub struct ServerKeyApi {
    key_ring: KeyRing,
}

impl ServerKeyApi {
    pub fn new(key_ring: KeyRing) -> Self {
        Self { key_ring }
    }

    /// Resolve keys through the key ring waterfall
    pub async fn fetch_keys(&self, requests: &LookupRequests) -> ServerKeyResult<LookupResults> {
        self.key_ring.fetch_keys(requests).await
    }

    /// Store keys into the key database
    pub async fn store_keys(&self, results: &LookupResults) -> ServerKeyResult<()> {
        self.key_ring.store_keys(results).await
    }
}

#[async_trait]
impl ServerKeyInternalApi for ServerKeyApi {
    fn key_ring(&self) -> KeyRing {
        // The real key ring: real database, real fetchers
        self.key_ring.clone()
    }

    async fn input_public_keys(
        &self,
        request: InputPublicKeysRequest,
    ) -> ServerKeyResult<InputPublicKeysResponse> {
        debug!("Storing {} public keys", request.keys.len());
        self.store_keys(&request.keys).await?;
        Ok(InputPublicKeysResponse {})
    }

    async fn query_public_keys(
        &self,
        request: QueryPublicKeysRequest,
    ) -> ServerKeyResult<QueryPublicKeysResponse> {
        match self.fetch_keys(&request.requests).await {
            Ok(results) => Ok(QueryPublicKeysResponse {
                results,
                missing: Vec::new(),
            }),
            Err(ServerKeyError::KeysMissing(partial)) => {
                let partial = *partial;
                Ok(QueryPublicKeysResponse {
                    results: partial.resolved,
                    missing: partial.missing,
                })
            }
            Err(e) => Err(e),
        }
    }
}
