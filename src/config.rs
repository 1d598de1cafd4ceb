//! Server configuration loaded from a TOML file.
//!
//! The file is optional: a missing or empty file yields `Config::default()`,
//! which serves a single in-memory collection. Unknown keys are accepted by
//! serde but logged as warnings since they are usually typos.
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Semantically invalid configuration (duplicate names, bad values).
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown adapter '{adapter}' for collection '{collection}'")]
    UnknownAdapter { collection: String, adapter: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level server configuration.
///
/// Every field has a default so any subset of keys may be given. `Debug` masks
/// `auth_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket address to listen on.
    pub listen: SocketAddr,

    /// Path prefix of the service document; collections live beneath it.
    pub base_path: String,

    /// Expose internal error detail in 500 responses.
    pub debug: bool,

    /// Entries per feed page when the client does not ask for a size.
    pub page_size: usize,

    /// `Cache-Control: max-age` for successful reads. 0 sends `no-cache`.
    pub cache_max_age: u64,

    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,

    /// Requests processed at once before answering 503. 0 = unlimited.
    pub max_concurrent_requests: usize,

    /// Bearer token required for unsafe methods. `ABDERA_AUTH_TOKEN` takes
    /// precedence over the file.
    pub auth_token: Option<String>,

    /// Title of the single workspace in the service document.
    pub workspace_title: String,

    pub collections: Vec<CollectionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            base_path: "/atom".to_string(),
            debug: false,
            page_size: 25,
            cache_max_age: 0,
            max_body_bytes: 10 * 1024 * 1024,
            max_concurrent_requests: 0,
            auth_token: None,
            workspace_title: "Abdera".to_string(),
            collections: vec![CollectionConfig::default()],
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("base_path", &self.base_path)
            .field("debug", &self.debug)
            .field("page_size", &self.page_size)
            .field("cache_max_age", &self.cache_max_age)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("workspace_title", &self.workspace_title)
            .field("collections", &self.collections)
            .finish()
    }
}

/// One `[[collections]]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectionConfig {
    /// Path segment of the collection; also its registry key.
    pub name: String,
    pub title: String,
    pub author: String,
    /// Adapter factory key (`memory`, `sqlite`, or a custom registration).
    pub adapter: String,
    /// Accepted media ranges. Empty means Atom entries only.
    pub accepts: Vec<String>,
    pub read_only: bool,
    /// SQLite file for the `sqlite` adapter (`:memory:` allowed).
    pub database: Option<String>,
    /// Fixed category terms. Empty lists the terms in use instead.
    pub categories: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "entries".to_string(),
            title: "Entries".to_string(),
            author: "Abdera".to_string(),
            adapter: "memory".to_string(),
            accepts: Vec::new(),
            read_only: false,
            database: None,
            categories: Vec::new(),
        }
    }
}

impl CollectionConfig {
    pub fn new(name: &str, adapter: &str) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            adapter: adapter.to_string(),
            ..Self::default()
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "listen",
    "base_path",
    "debug",
    "page_size",
    "cache_max_age",
    "max_body_bytes",
    "max_concurrent_requests",
    "auth_token",
    "workspace_title",
    "collections",
];

const KNOWN_COLLECTION_KEYS: &[&str] = &[
    "name",
    "title",
    "author",
    "adapter",
    "accepts",
    "read_only",
    "database",
    "categories",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line information
    /// - Unknown keys → accepted, logged as warnings
    /// - Duplicate collection names, empty names or a zero page size →
    ///   `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file is never loaded.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default().with_env());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default().with_env());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            listen = %config.listen,
            collections = config.collections.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default().with_env());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        let config = config.with_env();
        config.validate()?;
        Ok(config)
    }

    fn with_env(mut self) -> Self {
        if let Ok(token) = std::env::var("ABDERA_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".to_string()));
        }
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_path must start with '/': {}",
                self.base_path
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for collection in &self.collections {
            let name = collection.name.as_str();
            if name.is_empty() || name.contains(['/', ';', '?', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "collection name '{name}' must be a non-empty path segment"
                )));
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!("duplicate collection '{name}'")));
            }
        }
        Ok(())
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    let Some(toml::Value::Array(collections)) = raw.get("collections") else {
        return;
    };
    for table in collections.iter().filter_map(toml::Value::as_table) {
        for key in table.keys() {
            if !KNOWN_COLLECTION_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in [[collections]], ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
