/// Internal HTTP API routes for the server key component
use crate::{
    context::AppContext,
    error::{ServerKeyError, ServerKeyResult},
    keys::api::{
        InputPublicKeysRequest, InputPublicKeysResponse, QueryPublicKeysRequest,
        QueryPublicKeysResponse, SERVER_KEY_INPUT_PUBLIC_KEY_PATH,
        SERVER_KEY_QUERY_PUBLIC_KEY_PATH,
    },
    metrics,
};
use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Build the internal key API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route(SERVER_KEY_INPUT_PUBLIC_KEY_PATH, post(input_public_keys))
        .route(SERVER_KEY_QUERY_PUBLIC_KEY_PATH, post(query_public_keys))
}

/// Decode a request body, rejecting it before any work is done
fn decode_request<T: DeserializeOwned>(operation: &str, body: &[u8]) -> ServerKeyResult<T> {
    serde_json::from_slice(body).map_err(|e| {
        metrics::record_api_request(operation, "bad_request");
        debug!("Rejected {} request: {}", operation, e);
        ServerKeyError::Decode(e.to_string())
    })
}

async fn input_public_keys(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> ServerKeyResult<Json<InputPublicKeysResponse>> {
    let request: InputPublicKeysRequest = decode_request("inputPublicKeys", &body)?;

    match ctx.server_key_api.input_public_keys(request).await {
        Ok(response) => {
            metrics::record_api_request("inputPublicKeys", "ok");
            Ok(Json(response))
        }
        Err(e) => {
            metrics::record_api_request("inputPublicKeys", "error");
            Err(e)
        }
    }
}

async fn query_public_keys(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> ServerKeyResult<Json<QueryPublicKeysResponse>> {
    let request: QueryPublicKeysRequest = decode_request("queryPublicKeys", &body)?;

    match ctx.server_key_api.query_public_keys(request).await {
        Ok(response) => {
            let status = if response.missing.is_empty() { "ok" } else { "partial" };
            metrics::record_api_request("queryPublicKeys", status);
            Ok(Json(response))
        }
        Err(e) => {
            metrics::record_api_request("queryPublicKeys", "error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        keys::{
            testutil::{key, lookup, MemoryKeyDatabase, StaticKeyFetcher},
            KeyRing, LookupResults, ServerKeyApi, Timestamp,
        },
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::sync::{atomic::Ordering, Arc};
    use tower::ServiceExt;

    fn test_app(database: Arc<MemoryKeyDatabase>, known: LookupResults) -> Router {
        let fetcher = Arc::new(StaticKeyFetcher::new("direct", known));
        let api = ServerKeyApi::new(KeyRing::new(database, vec![fetcher]));
        let ctx = AppContext::with_api(ServerConfig::default(), Arc::new(api));
        routes().with_state(ctx)
    }

    fn post_json(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_body_rejected_before_lookup() {
        let database = Arc::new(MemoryKeyDatabase::default());
        let app = test_app(database.clone(), LookupResults::new());

        let response = app
            .oneshot(post_json(SERVER_KEY_QUERY_PUBLIC_KEY_PATH, "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(database.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_returns_results_and_missing() {
        let found = key("found.example");
        let lost = key("lost.example");
        let mut known = LookupResults::new();
        known.insert(found.clone(), lookup(u64::MAX, None));
        let app = test_app(Arc::new(MemoryKeyDatabase::default()), known);

        let body = serde_json::to_string(&QueryPublicKeysRequest {
            requests: [(found.clone(), Timestamp(0)), (lost.clone(), Timestamp(0))]
                .into_iter()
                .collect(),
        })
        .unwrap();

        let response = app
            .oneshot(post_json(SERVER_KEY_QUERY_PUBLIC_KEY_PATH, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded: QueryPublicKeysResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(decoded.results.contains_key(&found));
        assert_eq!(decoded.missing, vec![lost]);
    }

    #[tokio::test]
    async fn test_input_stores_keys() {
        let database = Arc::new(MemoryKeyDatabase::default());
        let app = test_app(database.clone(), LookupResults::new());
        let id = key("pushed.example");

        let mut keys = LookupResults::new();
        keys.insert(id.clone(), lookup(1_000, None));
        let body = serde_json::to_string(&InputPublicKeysRequest { keys }).unwrap();

        let response = app
            .oneshot(post_json(SERVER_KEY_INPUT_PUBLIC_KEY_PATH, &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(database.get(&id), Some(lookup(1_000, None)));
    }
}
