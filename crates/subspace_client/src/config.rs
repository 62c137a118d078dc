use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Transport flavour requested from the connection manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Http,
    Ws,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::Http => "http",
            ConnectionMode::Ws => "ws",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" | "https" => Some(ConnectionMode::Http),
            "ws" | "wss" => Some(ConnectionMode::Ws),
            _ => None,
        }
    }
}

/// Candidate endpoints of one provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSet {
    #[serde(default)]
    pub http: Vec<String>,
    #[serde(default)]
    pub ws: Vec<String>,
}

impl EndpointSet {
    pub fn for_mode(&self, mode: ConnectionMode) -> &[String] {
        match mode {
            ConnectionMode::Http => &self.http,
            ConnectionMode::Ws => &self.ws,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Provider name to endpoints. A network matches every provider whose
    /// name contains the network name.
    #[serde(default = "default_urls")]
    pub urls: BTreeMap<String, EndpointSet>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            mode: ConnectionMode::default(),
            cache_dir: default_cache_dir(),
            urls: default_urls(),
            connection: ConnectionConfig::default(),
            query: QueryConfig::default(),
            fetch: FetchConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

fn default_network() -> String {
    "local".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".subspace")
}

fn default_urls() -> BTreeMap<String, EndpointSet> {
    let mut urls = BTreeMap::new();
    urls.insert(
        "local".to_string(),
        EndpointSet {
            http: vec!["http://127.0.0.1:9933".to_string()],
            ws: vec!["ws://127.0.0.1:9944".to_string()],
        },
    );
    urls
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connection_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_true")]
    pub cache_connections: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Transport-level retries on request timeout.
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retries: default_connection_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
            cache_connections: true,
            request_timeout_ms: default_request_timeout_ms(),
            request_retries: default_request_retries(),
        }
    }
}

fn default_connection_retries() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_request_retries() -> u32 {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_map_retries")]
    pub map_retries: u32,
    #[serde(default = "default_map_backoff_base_ms")]
    pub map_backoff_base_ms: u64,
    #[serde(default = "default_map_backoff_max_ms")]
    pub map_backoff_max_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_results: default_max_results(),
            map_retries: default_map_retries(),
            map_backoff_base_ms: default_map_backoff_base_ms(),
            map_backoff_max_ms: default_map_backoff_max_ms(),
        }
    }
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_results() -> usize {
    100_000
}

fn default_map_retries() -> u32 {
    10
}

fn default_map_backoff_base_ms() -> u64 {
    1_000
}

fn default_map_backoff_max_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_ms: default_fetch_timeout_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_workers() -> usize {
    16
}

fn default_fetch_timeout_ms() -> u64 {
    60_000
}

fn default_max_rounds() -> usize {
    8
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Defaults to `<cache_dir>/archive`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_full_sync_secs")]
    pub full_sync_interval_secs: u64,
    #[serde(default = "default_light_sync_secs")]
    pub light_sync_interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention_hours: default_retention_hours(),
            full_sync_interval_secs: default_full_sync_secs(),
            light_sync_interval_secs: default_light_sync_secs(),
        }
    }
}

fn default_retention_hours() -> u64 {
    24
}

fn default_full_sync_secs() -> u64 {
    600
}

fn default_light_sync_secs() -> u64 {
    5
}

impl ClientConfig {
    /// Reads a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))
    }

    /// Reads `path` when it exists, otherwise returns the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        crate::cache::write_atomic(path.as_ref(), text.as_bytes())?;
        Ok(())
    }

    /// Builds a config from `SUBSPACE_CONFIG` (a TOML file) and then applies
    /// individual overrides:
    /// - `SUBSPACE_NETWORK` default network
    /// - `SUBSPACE_MODE` `http` or `ws`
    /// - `SUBSPACE_CACHE_DIR` cache root
    /// - `SUBSPACE_URL` single endpoint registered under the network name
    /// - `SUBSPACE_RPC_RETRIES` connection retries
    /// - `SUBSPACE_RPC_TIMEOUT_MS` per-request timeout
    /// - `SUBSPACE_FETCH_WORKERS` fan-out pool size
    pub fn from_env() -> Result<Self> {
        let mut cfg = match std::env::var("SUBSPACE_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(network) = std::env::var("SUBSPACE_NETWORK") {
            cfg.network = network;
        }
        if let Some(mode) = std::env::var("SUBSPACE_MODE")
            .ok()
            .and_then(|v| ConnectionMode::parse(&v))
        {
            cfg.mode = mode;
        }
        if let Ok(dir) = std::env::var("SUBSPACE_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("SUBSPACE_URL") {
            let set = cfg.urls.entry(cfg.network.clone()).or_default();
            if url.starts_with("ws") {
                set.ws.insert(0, url);
            } else {
                set.http.insert(0, url);
            }
        }
        cfg.connection.retries = env_parse("SUBSPACE_RPC_RETRIES", cfg.connection.retries);
        cfg.connection.request_timeout_ms =
            env_parse("SUBSPACE_RPC_TIMEOUT_MS", cfg.connection.request_timeout_ms);
        cfg.fetch.workers = env_parse("SUBSPACE_FETCH_WORKERS", cfg.fetch.workers);
        Ok(cfg)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive
            .dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("archive"))
    }

    /// Candidate URLs for `network` in `mode`, provider order preserved.
    pub fn candidate_urls(&self, network: &str, mode: ConnectionMode) -> Vec<String> {
        self.urls
            .iter()
            .filter(|(provider, _)| provider.contains(network))
            .flat_map(|(_, set)| set.for_mode(mode).iter().cloned())
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}
