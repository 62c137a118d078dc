use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ConnectionConfig;
use crate::connection::{
    BlockHeader, ChainConnection, Connector, ExtrinsicReceipt, SignedExtrinsic, StorageEntry,
};
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;

/// JSON-RPC connection to one node over blocking HTTP, with jittered
/// timeouts and retry on timeout.
pub struct RpcConnection {
    url: String,
    http: Client,
    request_timeout: Duration,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct Payload<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct MapPage {
    #[serde(default)]
    entries: Vec<MapPageEntry>,
    #[serde(default)]
    next_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MapPageEntry {
    key: Vec<Value>,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    number: Value,
}

fn timed_out(err: &ClientError) -> bool {
    matches!(err, ClientError::Transport(e) if e.is_timeout())
}

/// Maps `ws`/`wss` endpoints onto their HTTP equivalents.
pub fn http_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|e| ClientError::Config(format!("{raw}: {e}")))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        "http" | "https" => return Ok(url.to_string()),
        other => {
            return Err(ClientError::Config(format!(
                "unsupported scheme {other} in {raw}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Config(format!("cannot rewrite scheme of {raw}")))?;
    Ok(url.to_string())
}

/// Block numbers arrive either as JSON numbers or `0x` hex strings.
fn parse_block_number(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

impl RpcConnection {
    pub fn new(url: &str, config: &ConnectionConfig) -> Result<Self> {
        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let retry = RetryPolicy::new(
            config.request_retries.saturating_add(1),
            request_timeout,
            request_timeout.saturating_mul(8),
        )
        .with_jitter(Duration::from_millis(config.jitter_ms));
        Ok(Self {
            url: http_url(url)?,
            http: Client::new(),
            request_timeout,
            retry,
            next_id: AtomicU64::new(1),
        })
    }

    /// Posts `payload`. Only timed-out requests are resent; every attempt
    /// gets a freshly jittered timeout.
    fn send<T: Serialize>(&self, payload: &T) -> Result<Response> {
        self.retry.run_while(&self.url, timed_out, |attempt| {
            let timeout = self.retry.jittered(self.request_timeout);
            debug!(url = %self.url, attempt, timeout_ms = timeout.as_millis() as u64, "rpc send");
            Ok(self
                .http
                .post(&self.url)
                .json(payload)
                .timeout(timeout)
                .send()?)
        })
    }

    /// Sends one request; a JSON-RPC error becomes [`ClientError::Rpc`] and a
    /// missing result becomes `Value::Null`.
    pub fn request(&self, method: &str, params: Value) -> Result<Value> {
        let payload = Payload {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(url = %self.url, method, "rpc request");
        let envelope = self
            .send(&payload)?
            .error_for_status()?
            .json::<RpcEnvelope<Value>>()?;
        if let Some(error) = envelope.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    fn request_as<T: for<'de> Deserialize<'de>>(&self, method: &str, params: Value) -> Result<T> {
        Ok(serde_json::from_value(self.request(method, params)?)?)
    }

    fn head_hash(&self) -> Result<String> {
        match self.request("chain_getBlockHash", json!([]))? {
            Value::String(hash) => Ok(hash),
            other => Err(ClientError::Rpc {
                code: -32603,
                message: format!("unexpected head hash {other}"),
            }),
        }
    }
}

impl ChainConnection for RpcConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn query(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        block_hash: Option<&str>,
    ) -> Result<Value> {
        self.request(
            "subspace_query",
            json!({
                "module": module,
                "function": name,
                "params": params,
                "block_hash": block_hash,
            }),
        )
    }

    fn query_map(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        page_size: u32,
        max_results: usize,
        block_hash: Option<&str>,
    ) -> Result<Vec<StorageEntry>> {
        let mut entries = Vec::new();
        let mut start_key: Option<String> = None;
        loop {
            let page: MapPage = self.request_as(
                "subspace_queryMap",
                json!({
                    "module": module,
                    "function": name,
                    "params": params,
                    "page_size": page_size,
                    "start_key": start_key,
                    "block_hash": block_hash,
                }),
            )?;
            let fetched = page.entries.len();
            entries.extend(page.entries.into_iter().map(|e| (e.key, e.value)));
            if entries.len() >= max_results {
                entries.truncate(max_results);
                break;
            }
            match page.next_key {
                Some(next) if fetched > 0 => start_key = Some(next),
                _ => break,
            }
        }
        Ok(entries)
    }

    fn get_block(&self, hash: Option<&str>) -> Result<BlockHeader> {
        let hash = match hash {
            Some(h) => h.to_string(),
            None => self.head_hash()?,
        };
        let header: RawHeader = self.request_as("chain_getHeader", json!([hash]))?;
        let number = parse_block_number(&header.number).ok_or_else(|| ClientError::Rpc {
            code: -32603,
            message: format!("unparseable block number {}", header.number),
        })?;
        Ok(BlockHeader { number, hash })
    }

    fn get_block_hash(&self, number: u64) -> Result<String> {
        match self.request("chain_getBlockHash", json!([number]))? {
            Value::String(hash) => Ok(hash),
            _ => Err(ClientError::Rpc {
                code: -32602,
                message: format!("unknown block {number}"),
            }),
        }
    }

    fn account_nonce(&self, address: &str) -> Result<u64> {
        self.request_as("system_accountNextIndex", json!([address]))
    }

    fn submit_extrinsic(
        &self,
        extrinsic: &SignedExtrinsic,
        wait_for_inclusion: bool,
        wait_for_finalization: bool,
    ) -> Result<ExtrinsicReceipt> {
        let raw = self
            .request(
                "author_submitExtrinsic",
                json!({
                    "extrinsic": extrinsic,
                    "wait_for_inclusion": wait_for_inclusion,
                    "wait_for_finalization": wait_for_finalization,
                }),
            )
            .map_err(|e| match e {
                ClientError::Rpc { code, message } => {
                    ClientError::Submission(format!("{message} ({code})"))
                }
                other => other,
            })?;
        let mut receipt: ExtrinsicReceipt = serde_json::from_value(raw)?;
        if receipt.extrinsic_hash.is_empty() {
            receipt.extrinsic_hash = extrinsic.hash();
        }
        Ok(receipt)
    }
}

/// Opens [`RpcConnection`]s and checks the chain head before handing them
/// out.
pub struct HttpConnector {
    config: ConnectionConfig,
}

impl HttpConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

impl Connector for HttpConnector {
    fn open(&self, url: &str) -> Result<Arc<dyn ChainConnection>> {
        let conn = RpcConnection::new(url, &self.config)?;
        let head = conn.get_block(None)?;
        debug!(url = %conn.url, block = head.number, "node reachable");
        Ok(Arc::new(conn))
    }
}
