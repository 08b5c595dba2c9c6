// clinical-chat/crates/clinical-chat/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: String,
    pub history_timeout_seconds: u64,
    pub stream_open_timeout_seconds: u64,
    pub stream_idle_timeout_seconds: u64,
    pub token_batch_size: usize,
    pub attachment_cache_capacity: u64,
    pub max_attachment_bytes: usize,
    pub http_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".to_string(),
            history_timeout_seconds: 15,
            stream_open_timeout_seconds: 30,
            stream_idle_timeout_seconds: 120,
            token_batch_size: 32,
            attachment_cache_capacity: 256,
            max_attachment_bytes: 10 * 1024 * 1024,
            http_timeout_seconds: 600,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();
        let backend_url = env::var("CHAT_BACKEND_URL")
            .unwrap_or(defaults.backend_url)
            .trim_end_matches('/')
            .to_string();

        let config = Self {
            backend_url,
            history_timeout_seconds: Self::parse_var(
                "HISTORY_TIMEOUT_SECONDS",
                defaults.history_timeout_seconds,
            )?,
            stream_open_timeout_seconds: Self::parse_var(
                "STREAM_OPEN_TIMEOUT_SECONDS",
                defaults.stream_open_timeout_seconds,
            )?,
            stream_idle_timeout_seconds: Self::parse_var(
                "STREAM_IDLE_TIMEOUT_SECONDS",
                defaults.stream_idle_timeout_seconds,
            )?,
            token_batch_size: Self::parse_var("TOKEN_BATCH_SIZE", defaults.token_batch_size)?,
            attachment_cache_capacity: Self::parse_var(
                "ATTACHMENT_CACHE_CAPACITY",
                defaults.attachment_cache_capacity,
            )?,
            max_attachment_bytes: Self::parse_var(
                "MAX_ATTACHMENT_BYTES",
                defaults.max_attachment_bytes,
            )?,
            http_timeout_seconds: Self::parse_var(
                "HTTP_TIMEOUT_SECONDS",
                defaults.http_timeout_seconds,
            )?,
        };

        if config.token_batch_size == 0 {
            return Err(anyhow::anyhow!("TOKEN_BATCH_SIZE must be at least 1"));
        }

        Ok(config)
    }

    fn parse_var<T>(name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match env::var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
            Err(_) => Ok(default),
        }
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_seconds)
    }

    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_open_timeout_seconds)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Backend URL: {}", self.backend_url);
        info!("- History Timeout: {}s", self.history_timeout_seconds);
        info!("- Stream Open Timeout: {}s", self.stream_open_timeout_seconds);
        info!("- Stream Idle Timeout: {}s", self.stream_idle_timeout_seconds);
        info!("- Token Batch Size: {}", self.token_batch_size);
        info!("- Attachment Cache Capacity: {}", self.attachment_cache_capacity);
        info!("- Max Attachment Bytes: {}", self.max_attachment_bytes);
    }
}
