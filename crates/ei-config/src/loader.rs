//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "ei-server.toml",
    "./config/config.toml",
    "/etc/ei-server/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("EI_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("CLIENT_ID") {
            config.oauth.client_id = val;
        }
        if let Ok(val) = env::var("CLIENT_SECRET") {
            config.oauth.client_secret = val;
        }
        if let Ok(val) = env::var("TOKEN_ENDPOINT") {
            config.oauth.token_endpoint = val;
        }
        if let Ok(val) = env::var("GRAPH_API_BASE_URL") {
            config.oauth.graph_api_base_url = val;
        }

        if let Ok(val) = env_parsed("API_PORT") {
            config.http.api_port = val;
        }
        if let Ok(val) = env_parsed("WEBHOOK_PORT") {
            config.http.webhook_port = val;
        }

        if let Ok(val) = env_parsed("POLLING_INTERVAL") {
            config.polling.polling_interval_secs = val;
        }
        if let Ok(val) = env_parsed("MAX_POLL_PAGES") {
            config.polling.max_poll_pages = val;
        }
        if let Ok(val) = env_parsed("BATCH_SIZE") {
            config.polling.batch_size = val;
        }
        if let Ok(val) = env_parsed("MAX_WORKERS") {
            config.polling.max_workers = val;
        }

        if let Ok(val) = env_parsed("GRAPH_API_RATE_LIMIT_THRESHOLD") {
            config.rate_limit.threshold = val;
        }
        if let Ok(val) = env_parsed("GRAPH_API_RATE_LIMIT_WINDOW_SECONDS") {
            config.rate_limit.window_seconds = val;
        }
        if let Ok(val) = env_parsed("GRAPH_API_RATE_LIMIT_RETRY_DELAY_SECONDS") {
            config.rate_limit.retry_delay_seconds = val;
        }

        if let Ok(val) = env_parsed("GRAPH_API_MAX_RETRIES") {
            config.retry.max_retries = val;
        }
        if let Ok(val) = env_parsed("GRAPH_API_INITIAL_BACKOFF_SECONDS") {
            config.retry.initial_backoff_seconds = val;
        }
        if let Ok(val) = env_parsed("GRAPH_API_BACKOFF_FACTOR") {
            config.retry.backoff_factor = val;
        }

        if let Ok(val) = env::var("REDIS_URL") {
            config.store.redis_url = val;
        }

        if let Ok(val) = env::var("MESSAGE_BUS_URL") {
            config.message_bus.url = val;
        }
        if let Ok(val) = env::var("MESSAGE_BUS_EXCHANGE") {
            config.message_bus.exchange = val;
        }
        if let Ok(val) = env::var("MESSAGE_BUS_ROUTING_KEY") {
            config.message_bus.routing_key = val;
        }
        if let Ok(val) = env::var("MESSAGE_BUS_ENABLED") {
            config.message_bus.enabled = val.parse().unwrap_or(true);
        }

        if let Ok(val) = env::var("MS4_PERSISTENCE_BASE_URL") {
            config.forwarder.persistence_base_url = val;
        }
        if let Ok(val) = env_parsed("MS4_BATCH_SIZE") {
            config.forwarder.batch_size = val;
        }
        if let Ok(val) = env::var("OUTBOUND_FORWARDING_ENABLED") {
            config.forwarder.enabled = val.parse().unwrap_or(true);
        }

        if let Ok(val) = env::var("LOG_FORMAT") {
            config.logging.format = val;
        }

        if let Ok(val) = env::var("SPAM_PATTERNS") {
            config.spam_patterns = val.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<T, ()> {
    env::var(key).ok().and_then(|v| v.parse().ok()).ok_or(())
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let config = AppConfig::default();
        assert_eq!(config.http.api_port, 8000);
        assert_eq!(config.http.webhook_port, 8100);
        assert_eq!(config.polling.max_poll_pages, 10);
    }
}
