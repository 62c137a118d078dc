//! Chain node capability and the manager that opens, caches and retries
//! connections to it.

use metrics::increment_counter;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConnectionMode};
use crate::error::{ClientError, Result};
use crate::retry::{self, RetryPolicy};
use crate::signer::Signer;

/// One `(key, value)` pair of a storage map. Plain maps have one key
/// element, double maps two.
pub type StorageEntry = (Vec<Value>, Value);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedExtrinsic {
    pub call: Value,
    pub signer: String,
    pub nonce: u64,
    pub tip: u64,
    /// Hex-encoded signature over [`SignedExtrinsic::signing_payload`].
    pub signature: String,
}

impl SignedExtrinsic {
    pub fn sign(call: &Value, signer: &dyn Signer, nonce: u64, tip: u64) -> Result<Self> {
        let address = signer.address();
        let payload = Self::signing_payload(call, &address, nonce, tip)?;
        let signature = signer.sign(&payload)?;
        Ok(Self {
            call: call.clone(),
            signer: address,
            nonce,
            tip,
            signature: hex::encode(signature),
        })
    }

    pub fn signing_payload(call: &Value, signer: &str, nonce: u64, tip: u64) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::json!({
            "call": call,
            "signer": signer,
            "nonce": nonce,
            "tip": tip,
        }))?)
    }

    /// `0x`-prefixed SHA-256 of the encoded extrinsic.
    pub fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("0x{}", hex::encode(Sha256::digest(bytes)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicReceipt {
    #[serde(default)]
    pub extrinsic_hash: String,
    #[serde(default)]
    pub block_hash: Option<String>,
    pub is_success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Storage reads and extrinsic submission against one node.
pub trait ChainConnection: Send + Sync {
    fn url(&self) -> &str;

    fn query(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        block_hash: Option<&str>,
    ) -> Result<Value>;

    /// Every entry under the `params` prefix, up to `max_results`, fetched
    /// `page_size` entries per request.
    fn query_map(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        page_size: u32,
        max_results: usize,
        block_hash: Option<&str>,
    ) -> Result<Vec<StorageEntry>>;

    /// Header at `hash`, or the chain head when `None`.
    fn get_block(&self, hash: Option<&str>) -> Result<BlockHeader>;

    fn get_block_hash(&self, number: u64) -> Result<String>;

    fn account_nonce(&self, address: &str) -> Result<u64>;

    fn create_signed_extrinsic(
        &self,
        call: &Value,
        signer: &dyn Signer,
        nonce: Option<u64>,
        tip: u64,
    ) -> Result<SignedExtrinsic> {
        let nonce = match nonce {
            Some(n) => n,
            None => self.account_nonce(&signer.address())?,
        };
        SignedExtrinsic::sign(call, signer, nonce, tip)
    }

    fn submit_extrinsic(
        &self,
        extrinsic: &SignedExtrinsic,
        wait_for_inclusion: bool,
        wait_for_finalization: bool,
    ) -> Result<ExtrinsicReceipt>;
}

/// Opens a [`ChainConnection`] for a URL.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str) -> Result<Arc<dyn ChainConnection>>;
}

/// Resolves endpoints, opens connections with retry and keeps them keyed by
/// URL for reuse.
pub struct ConnectionManager {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    pool: Mutex<HashMap<String, Arc<dyn ChainConnection>>>,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let conn = &config.connection;
        let retry = RetryPolicy::new(
            conn.retries,
            Duration::from_millis(conn.backoff_base_ms),
            Duration::from_millis(conn.backoff_max_ms),
        )
        .with_jitter(Duration::from_millis(conn.jitter_ms));
        Self {
            config: config.clone(),
            connector,
            retry,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_network(&self) -> &str {
        &self.config.network
    }

    pub fn default_mode(&self) -> ConnectionMode {
        self.config.mode
    }

    /// Picks one configured URL for `network` at random.
    pub fn resolve_url(&self, network: &str, mode: ConnectionMode) -> Result<String> {
        let candidates = self.config.candidate_urls(network, mode);
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ClientError::NoEndpoint {
                network: network.to_string(),
                mode: mode.as_str().to_string(),
            })
    }

    /// Connection to `network` in the default mode.
    pub fn connection(&self, network: &str) -> Result<Arc<dyn ChainConnection>> {
        self.get_connection(network, self.config.mode, None, false)
    }

    /// Returns a cached connection or opens a new one. An explicit `url`
    /// skips resolution; `refresh` replaces any cached connection.
    pub fn get_connection(
        &self,
        network: &str,
        mode: ConnectionMode,
        url: Option<&str>,
        refresh: bool,
    ) -> Result<Arc<dyn ChainConnection>> {
        let cache_enabled = self.config.connection.cache_connections;
        if let (Some(url), true, false) = (url, cache_enabled, refresh) {
            if let Some(conn) = self.cached(url) {
                return Ok(conn);
            }
        }

        let target = url.unwrap_or(network).to_string();
        let attempts = self.retry.attempts;
        let result = self.retry.run("connect", |attempt| {
            let url = match url {
                Some(u) => u.to_string(),
                None => self.resolve_url(network, mode)?,
            };
            if cache_enabled && !refresh {
                if let Some(conn) = self.cached(&url) {
                    return Ok(conn);
                }
            }
            if attempt > 0 {
                increment_counter!("subspace_connection_retry_total");
            }
            debug!(%url, attempt, "opening connection");
            let conn = self.connector.open(&url).map_err(|e| {
                warn!(%url, attempt, error = %e, "connection attempt failed");
                retry::exhausted(&url, attempt + 1, &e)
            })?;
            if cache_enabled {
                self.pool
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(url.clone(), Arc::clone(&conn));
            }
            info!(%url, network, "connected");
            Ok(conn)
        });
        result.map_err(|e| match e {
            ClientError::Connection { reason, .. } => ClientError::Connection {
                target,
                attempts,
                reason,
            },
            other => other,
        })
    }

    fn cached(&self, url: &str) -> Option<Arc<dyn ChainConnection>> {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Drops the cached connection for `url`.
    pub fn invalidate(&self, url: &str) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url)
            .is_some()
    }

    pub fn cached_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        urls.sort();
        urls
    }

    /// Drops every cached connection.
    pub fn clear(&self) {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
