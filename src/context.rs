/// Application context and dependency injection
use crate::{
    config::ServerConfig,
    db,
    error::{ServerKeyError, ServerKeyResult},
    keys::{
        DirectKeyFetcher, KeyFetcher, KeyRing, PerspectiveKeyFetcher, ServerKeyApi,
        ServerKeyInternalApi, SqliteKeyDatabase,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub server_key_api: Arc<dyn ServerKeyInternalApi>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> ServerKeyResult<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.data_directory).await?;

        let pool = db::create_pool(&config.storage.key_db, db::DatabaseOptions::default()).await?;
        db::test_connection(&pool).await?;

        let database = Arc::new(SqliteKeyDatabase::new(pool).await?);
        info!(
            "Key database ready at {} ({} keys stored)",
            config.storage.key_db.display(),
            database.count().await?
        );

        let fetchers = Self::build_fetchers(&config)?;
        let key_ring = KeyRing::new(database, fetchers);

        Ok(Self::with_api(config, Arc::new(ServerKeyApi::new(key_ring))))
    }

    /// Create a context around an already built key API
    pub fn with_api(config: ServerConfig, server_key_api: Arc<dyn ServerKeyInternalApi>) -> Self {
        Self {
            config: Arc::new(config),
            server_key_api,
        }
    }

    /// Fetchers in the order the key ring consults them
    fn build_fetchers(config: &ServerConfig) -> ServerKeyResult<Vec<Arc<dyn KeyFetcher>>> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.fetchers.user_agent.clone())
            .timeout(Duration::from_secs(config.fetchers.timeout_secs))
            .build()
            .map_err(|e| ServerKeyError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut fetchers: Vec<Arc<dyn KeyFetcher>> = Vec::new();

        if config.fetchers.direct_enabled {
            fetchers.push(Arc::new(DirectKeyFetcher::new(http_client.clone())));
        }

        for base_url in config.perspective_urls() {
            fetchers.push(Arc::new(PerspectiveKeyFetcher::new(
                &base_url,
                http_client.clone(),
            )));
        }

        for fetcher in &fetchers {
            info!("Key fetcher enabled: {}", fetcher.fetcher_name());
        }

        Ok(fetchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.storage.data_directory = dir.path().to_path_buf();
        config.storage.key_db = dir.path().join("serverkeys.sqlite");
        config
    }

    #[tokio::test]
    async fn test_new_context_creates_key_database() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let ctx = AppContext::new(config).await.unwrap();

        assert!(dir.path().join("serverkeys.sqlite").exists());
        assert_eq!(ctx.server_key_api.key_ring().fetchers().len(), 2);
    }

    #[test]
    fn test_fetcher_order() {
        let mut config = ServerConfig::default();
        config.fetchers.perspective_servers =
            vec!["notary1.example".to_string(), "notary2.example".to_string()];

        let names: Vec<String> = AppContext::build_fetchers(&config)
            .unwrap()
            .iter()
            .map(|f| f.fetcher_name().to_string())
            .collect();

        assert_eq!(names[0], "DirectKeyFetcher");
        assert_eq!(names[1], "PerspectiveKeyFetcher:https://notary1.example");
        assert_eq!(names[2], "PerspectiveKeyFetcher:https://notary2.example");
    }

    #[test]
    fn test_direct_fetcher_can_be_disabled() {
        let mut config = ServerConfig::default();
        config.fetchers.direct_enabled = false;
        config.fetchers.perspective_servers.clear();

        assert!(AppContext::build_fetchers(&config).unwrap().is_empty());
    }
}
