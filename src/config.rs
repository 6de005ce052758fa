//! Server configuration
//!
//! Stored as JSON. Missing or empty files yield defaults; selected fields can
//! be overridden from `THREADSYNC_*` environment variables.
//!
//! # Example
//! ```rust,no_run
//! use threadsync::config::Config;
//!
//! let mut config = Config::load("threadsync.json").expect("Failed to load");
//! config.apply_env().expect("Invalid environment override");
//! println!("API on {}", config.api_addr);
//! ```

use crate::{
    crypto::MasterKey,
    message_service::{MessageLimits, DEFAULT_PAGE_SIZE},
    realtime::TokenTable,
    retry::RetryPolicy,
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database_path: String,
    /// HTTP API bind address
    pub api_addr: String,
    /// WebSocket gateway bind address
    pub realtime_addr: String,
    /// Hex-encoded 32-byte master key wrapping the per-thread keys
    pub master_key_hex: Option<String>,
    /// Page size used when a request gives none
    pub default_page_size: usize,
    /// Largest page a request may ask for
    pub max_page_size: usize,
    /// Maximum message content length in bytes
    pub max_content_len: usize,
    /// Retry policy for transient storage failures
    pub persistence_retry: RetryPolicy,
    /// Backoff policy for client reconnection
    pub reconnect: RetryPolicy,
    /// Typing indicator expiry in milliseconds
    pub typing_ttl_ms: u64,
    /// Bearer token -> user id
    pub auth_tokens: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let limits = MessageLimits::default();
        Self {
            database_path: "threadsync.db".to_string(),
            api_addr: "127.0.0.1:8080".to_string(),
            realtime_addr: "127.0.0.1:8081".to_string(),
            master_key_hex: None,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: limits.max_page_size,
            max_content_len: limits.max_content_len,
            persistence_retry: RetryPolicy::default(),
            reconnect: RetryPolicy::new(u32::MAX, 500, 30_000),
            typing_ttl_ms: 5_000,
            auth_tokens: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, or defaults if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("Failed to read config: {}", e)))?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Storage(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON, creating the parent directory
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, json).map_err(|e| Error::Storage(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup
    ///
    /// Recognised: `THREADSYNC_DATABASE`, `THREADSYNC_API_ADDR`,
    /// `THREADSYNC_REALTIME_ADDR`, `THREADSYNC_MASTER_KEY`,
    /// `THREADSYNC_MAX_CONTENT_LEN`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("THREADSYNC_DATABASE") {
            self.database_path = path;
        }
        if let Some(addr) = lookup("THREADSYNC_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(addr) = lookup("THREADSYNC_REALTIME_ADDR") {
            self.realtime_addr = addr;
        }
        if let Some(key) = lookup("THREADSYNC_MASTER_KEY") {
            self.master_key_hex = Some(key);
        }
        if let Some(len) = lookup("THREADSYNC_MAX_CONTENT_LEN") {
            self.max_content_len = len
                .parse()
                .map_err(|_| Error::Validation(format!("THREADSYNC_MAX_CONTENT_LEN is not a number: {}", len)))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(Error::Validation(format!(
                "default page size {} must be between 1 and {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.max_content_len == 0 {
            return Err(Error::Validation("max content length must be positive".to_string()));
        }
        Ok(())
    }

    /// Parsed API bind address
    pub fn api_socket_addr(&self) -> Result<SocketAddr> {
        parse_addr("api_addr", &self.api_addr)
    }

    /// Parsed realtime bind address
    pub fn realtime_socket_addr(&self) -> Result<SocketAddr> {
        parse_addr("realtime_addr", &self.realtime_addr)
    }

    /// The configured master key
    pub fn master_key(&self) -> Result<MasterKey> {
        match &self.master_key_hex {
            Some(hex_key) => MasterKey::from_hex(hex_key),
            None => Err(Error::Crypto(
                "master key not configured (set master_key_hex or THREADSYNC_MASTER_KEY)".to_string(),
            )),
        }
    }

    /// Limits for the message service
    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            max_content_len: self.max_content_len,
        }
    }

    /// Typing indicator expiry
    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    /// Authenticator built from the static token table
    pub fn token_table(&self) -> TokenTable {
        TokenTable::new(self.auth_tokens.clone())
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Validation(format!("invalid {} '{}': {}", field, value, e)))
}
