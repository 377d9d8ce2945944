/// Configuration management for the server key service
use crate::error::{ServerKeyError, ServerKeyResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub fetchers: FetcherConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Our own federation server name
    pub server_name: String,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub key_db: PathBuf,
}

/// Remote key fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Ask owning servers directly for their keys
    pub direct_enabled: bool,
    /// Notary servers to ask, in order, after direct fetching
    pub perspective_servers: Vec<String>,
    /// Timeout for a single fetch in seconds
    pub timeout_secs: u64,
    pub user_agent: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_directory = PathBuf::from("./data");
        Self {
            service: ServiceConfig {
                hostname: "0.0.0.0".to_string(),
                port: 7780,
                server_name: "localhost".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                key_db: data_directory.join("serverkeys.sqlite"),
                data_directory,
            },
            fetchers: FetcherConfig {
                direct_enabled: true,
                perspective_servers: vec!["matrix.org".to_string()],
                timeout_secs: 30,
                user_agent: format!("serverkey-api/{}", env!("CARGO_PKG_VERSION")),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ServerKeyResult<Self> {
        dotenv::dotenv().ok();

        let defaults = ServerConfig::default();

        let hostname = env::var("KEYSERVER_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = match env::var("KEYSERVER_PORT") {
            Ok(port) => port
                .parse()
                .map_err(|_| ServerKeyError::Validation("Invalid port number".to_string()))?,
            Err(_) => defaults.service.port,
        };
        let server_name = env::var("KEYSERVER_SERVER_NAME").unwrap_or(defaults.service.server_name);
        let version = env::var("KEYSERVER_VERSION").unwrap_or(defaults.service.version);

        let data_directory: PathBuf = env::var("KEYSERVER_DATA_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.data_directory);
        let key_db = env::var("KEYSERVER_KEY_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("serverkeys.sqlite"));

        let direct_enabled = env::var("KEYSERVER_DIRECT_FETCH_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.fetchers.direct_enabled);
        let perspective_servers = match env::var("KEYSERVER_PERSPECTIVE_SERVERS") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.fetchers.perspective_servers,
        };
        let timeout_secs = env::var("KEYSERVER_FETCH_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.fetchers.timeout_secs);
        let user_agent = env::var("KEYSERVER_USER_AGENT").unwrap_or(defaults.fetchers.user_agent);

        let log_level = env::var("RUST_LOG").unwrap_or(defaults.logging.level);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                server_name,
                version,
            },
            storage: StorageConfig {
                data_directory,
                key_db,
            },
            fetchers: FetcherConfig {
                direct_enabled,
                perspective_servers,
                timeout_secs,
                user_agent,
            },
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> ServerKeyResult<()> {
        if self.service.hostname.is_empty() {
            return Err(ServerKeyError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.service.server_name.is_empty() {
            return Err(ServerKeyError::Validation(
                "Server name cannot be empty".to_string(),
            ));
        }

        if self.fetchers.timeout_secs == 0 {
            return Err(ServerKeyError::Validation(
                "Fetch timeout must be at least one second".to_string(),
            ));
        }

        if !self.fetchers.direct_enabled && self.fetchers.perspective_servers.is_empty() {
            tracing::warn!("No key fetchers configured; only stored keys can be served");
        }

        Ok(())
    }

    /// Base URLs of the configured notary servers
    pub fn perspective_urls(&self) -> Vec<String> {
        self.fetchers
            .perspective_servers
            .iter()
            .map(|server| {
                if server.starts_with("http://") || server.starts_with("https://") {
                    server.trim_end_matches('/').to_string()
                } else {
                    format!("https://{}", server)
                }
            })
            .collect()
    }
}
