//! Cached storage reads.
//!
//! Every read is keyed by a path of the form
//! `query/{network}/{module}.{name}[::params::{p1}-{p2}…]`. With `use_cache`
//! set, a present entry is returned without touching the chain; otherwise
//! the chain is read and the entry overwritten. Reads pinned to a block are
//! never cached.

use metrics::{histogram, increment_counter};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::DiskCache;
use crate::config::ClientConfig;
use crate::connection::{BlockHeader, ChainConnection, ConnectionManager, StorageEntry};
use crate::error::{ClientError, Result};
use crate::registry::{self, StorageItem, SUBSPACE_MODULE};
use crate::retry::RetryPolicy;

/// Which subnet a read is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Item is not partitioned.
    Global,
    /// Every partition; results come back keyed by netuid.
    All,
    Id(u16),
    /// Subnet name, resolved through `SubnetNames`.
    Named(String),
}

impl Partition {
    /// `all` is [`Partition::All`], digits are an id, anything else a name.
    pub fn parse(raw: &str) -> Self {
        if raw == "all" {
            Partition::All
        } else if let Ok(id) = raw.parse::<u16>() {
            Partition::Id(id)
        } else {
            Partition::Named(raw.to_string())
        }
    }
}

impl From<u16> for Partition {
    fn from(id: u16) -> Self {
        Partition::Id(id)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Global => write!(f, "global"),
            Partition::All => write!(f, "all"),
            Partition::Id(id) => write!(f, "{id}"),
            Partition::Named(name) => write!(f, "{name}"),
        }
    }
}

/// A storage read request.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageQuery {
    pub module: String,
    pub name: String,
    pub params: Vec<Value>,
    pub partition: Partition,
    pub block: Option<u64>,
    pub network: Option<String>,
    pub page_size: Option<u32>,
    pub max_results: Option<usize>,
}

impl StorageQuery {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            params: Vec::new(),
            partition: Partition::Global,
            block: None,
            network: None,
            page_size: None,
            max_results: None,
        }
    }

    pub fn item(item: StorageItem) -> Self {
        Self::new(item.module(), item.storage_name())
    }

    /// Accepts registry feature names (`stake_from`), chain names
    /// (`StakeFrom`) or unregistered snake-case names.
    pub fn feature(name: &str) -> Self {
        let (module, storage) = registry::resolve_name(name, SUBSPACE_MODULE);
        Self::new(module, storage)
    }

    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn params(mut self, values: Vec<Value>) -> Self {
        self.params = values;
        self
    }

    pub fn partition(mut self, partition: impl Into<Partition>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn at_block(mut self, block: Option<u64>) -> Self {
        self.block = block;
        self
    }

    pub fn on(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }
}

/// Map key after normalisation. Digit strings become integers; integers
/// sort numerically and before strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Int(u64),
    Str(String),
}

impl MapKey {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(i) => MapKey::Int(i),
                None => MapKey::Str(n.to_string()),
            },
            Value::String(s) => Self::from_text(s),
            other => MapKey::Str(other.to_string()),
        }
    }

    pub fn from_text(s: &str) -> Self {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(i) = s.parse() {
                return MapKey::Int(i);
            }
        }
        MapKey::Str(s.to_string())
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            MapKey::Int(i) => Some(*i),
            MapKey::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MapKey::Int(_) => None,
            MapKey::Str(s) => Some(s),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int(i) => write!(f, "{i}"),
            MapKey::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for MapKey {
    fn from(i: u64) -> Self {
        MapKey::Int(i)
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::from_text(s)
    }
}

impl Serialize for MapKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = MapKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or unsigned integer map key")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MapKey, E> {
                Ok(MapKey::Int(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<MapKey, E> {
                Ok(MapKey::from_text(v))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MapValue {
    Value(Value),
    /// Second level of a double map.
    Map(BTreeMap<MapKey, Value>),
}

impl MapValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            MapValue::Value(v) => Some(v),
            MapValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, Value>> {
        match self {
            MapValue::Value(_) => None,
            MapValue::Map(m) => Some(m),
        }
    }
}

/// Normalised result of a map read, sorted at both levels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryMapResult {
    entries: BTreeMap<MapKey, MapValue>,
}

#[derive(Serialize, Deserialize)]
struct CachedMap {
    nested: bool,
    entries: BTreeMap<MapKey, Value>,
}

impl QueryMapResult {
    /// Builds the result from raw chain pairs. Single-element keys give
    /// scalar entries, two-element keys one nested level.
    pub fn from_entries(raw: Vec<StorageEntry>) -> Self {
        let mut entries: BTreeMap<MapKey, MapValue> = BTreeMap::new();
        for (key, value) in raw {
            match key.as_slice() {
                [] => continue,
                [k] => {
                    entries.insert(MapKey::from_value(k), MapValue::Value(value));
                }
                [outer, inner, ..] => {
                    let slot = entries
                        .entry(MapKey::from_value(outer))
                        .or_insert_with(|| MapValue::Map(BTreeMap::new()));
                    if let MapValue::Value(_) = slot {
                        *slot = MapValue::Map(BTreeMap::new());
                    }
                    if let MapValue::Map(map) = slot {
                        map.insert(MapKey::from_value(inner), value);
                    }
                }
            }
        }
        Self { entries }
    }

    pub fn is_nested(&self) -> bool {
        self.entries.values().any(|v| matches!(v, MapValue::Map(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<&MapValue> {
        self.entries.get(key)
    }

    pub fn value(&self, key: impl Into<MapKey>) -> Option<&Value> {
        self.entries.get(&key.into()).and_then(MapValue::as_value)
    }

    /// Inner map of partition `id` in a nested result.
    pub fn partition(&self, id: u16) -> Option<&BTreeMap<MapKey, Value>> {
        self.entries
            .get(&MapKey::Int(id as u64))
            .and_then(MapValue::as_map)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MapKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &MapValue)> {
        self.entries.iter()
    }

    /// Scalar entries only.
    pub fn values(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_value().map(|v| (k, v)))
    }

    /// Inner maps only.
    pub fn maps(&self) -> impl Iterator<Item = (&MapKey, &BTreeMap<MapKey, Value>)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_map().map(|m| (k, m)))
    }

    pub fn into_entries(self) -> BTreeMap<MapKey, MapValue> {
        self.entries
    }

    fn to_cached(&self) -> Result<CachedMap> {
        let nested = self.is_nested();
        let mut entries = BTreeMap::new();
        for (k, v) in &self.entries {
            let value = match v {
                MapValue::Value(v) => v.clone(),
                MapValue::Map(m) => serde_json::to_value(m)?,
            };
            entries.insert(k.clone(), value);
        }
        Ok(CachedMap { nested, entries })
    }

    fn from_cached(cached: CachedMap) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (k, v) in cached.entries {
            let value = if cached.nested {
                MapValue::Map(serde_json::from_value(v)?)
            } else {
                MapValue::Value(v)
            };
            entries.insert(k, value);
        }
        Ok(Self { entries })
    }
}

/// Chain text arrives either as a string or as a byte array.
pub fn decode_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(|b| b.as_u64().map(|b| b as u8))
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numbers arrive as JSON numbers, decimal strings or `0x` hex strings.
pub fn decode_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).unwrap_or(0),
            None => s.parse().unwrap_or(0),
        },
        Value::Bool(b) => *b as u64,
        _ => 0,
    }
}

fn param_segment(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    raw.replace(['/', '\\'], "_")
}

/// Cache key of a read.
pub fn cache_path(network: &str, module: &str, name: &str, params: &[Value]) -> String {
    let mut path = format!("query/{network}/{module}.{name}");
    if !params.is_empty() {
        let joined: Vec<String> = params.iter().map(param_segment).collect();
        path.push_str("::params::");
        path.push_str(&joined.join("-"));
    }
    path
}

struct Prepared {
    network: String,
    params: Vec<Value>,
    path: String,
}

pub struct QueryEngine {
    connections: Arc<ConnectionManager>,
    cache: Arc<DiskCache>,
    network: String,
    page_size: u32,
    max_results: usize,
    map_retry: RetryPolicy,
}

impl QueryEngine {
    pub fn new(
        config: &ClientConfig,
        connections: Arc<ConnectionManager>,
        cache: Arc<DiskCache>,
    ) -> Self {
        let q = &config.query;
        Self {
            connections,
            cache,
            network: config.network.clone(),
            page_size: q.page_size,
            max_results: q.max_results,
            map_retry: RetryPolicy::new(
                q.map_retries,
                Duration::from_millis(q.map_backoff_base_ms),
                Duration::from_millis(q.map_backoff_max_ms),
            ),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn resolve_network(&self, network: Option<&str>) -> String {
        network.unwrap_or(&self.network).to_string()
    }

    /// Single storage value. Absent values come back as `Value::Null`.
    pub fn query(&self, q: &StorageQuery, use_cache: bool) -> Result<Value> {
        let prep = self.prepare(q)?;
        let cacheable = q.block.is_none();
        if use_cache && cacheable {
            if let Some(value) = self.cache.lookup::<Value>(&prep.path) {
                debug!(path = %prep.path, "query served from cache");
                return Ok(value);
            }
        }
        let _span = crate::log_context!(query = prep.path).entered();
        let conn = self.connections.connection(&prep.network)?;
        let block_hash = self.block_hash_for(conn.as_ref(), q)?;
        let value = conn
            .query(&q.module, &q.name, &prep.params, block_hash.as_deref())
            .map_err(|e| chain_error(&q.module, &q.name, e))?;
        increment_counter!("subspace_query_total");
        if cacheable {
            self.store(&prep.path, &value);
        }
        Ok(value)
    }

    /// Whole map under the query's prefix. The full fetch is retried with
    /// exponential backoff and a refreshed connection on transient failure.
    pub fn query_map(&self, q: &StorageQuery, use_cache: bool) -> Result<QueryMapResult> {
        let prep = self.prepare(q)?;
        let cacheable = q.block.is_none();
        if use_cache && cacheable {
            if let Some(cached) = self.cache.lookup::<CachedMap>(&prep.path) {
                match QueryMapResult::from_cached(cached) {
                    Ok(result) => {
                        debug!(path = %prep.path, "query_map served from cache");
                        return Ok(result);
                    }
                    Err(e) => warn!(path = %prep.path, error = %e, "cached map unreadable"),
                }
            }
        }
        let _span = crate::log_context!(query = prep.path).entered();
        let page_size = q.page_size.unwrap_or(self.page_size);
        let max_results = q.max_results.unwrap_or(self.max_results);
        let mode = self.connections.default_mode();
        // Opening already retries on its own; only read failures re-enter
        // this loop, each time on a refreshed connection.
        let raw = self.map_retry.run_while(&prep.path, retryable_read, |attempt| {
            let conn =
                self.connections
                    .get_connection(&prep.network, mode, None, attempt > 0)?;
            let block_hash = self.block_hash_for(conn.as_ref(), q)?;
            conn.query_map(
                &q.module,
                &q.name,
                &prep.params,
                page_size,
                max_results,
                block_hash.as_deref(),
            )
            .map_err(|e| chain_error(&q.module, &q.name, e))
        })?;
        histogram!("subspace_query_map_entries", raw.len() as f64);
        let result = QueryMapResult::from_entries(raw);
        if cacheable {
            match result.to_cached() {
                Ok(cached) => self.store(&prep.path, &cached),
                Err(e) => warn!(path = %prep.path, error = %e, "map not cacheable"),
            }
        }
        Ok(result)
    }

    fn store<T: Serialize>(&self, path: &str, value: &T) {
        if let Err(e) = self.cache.put(path, value) {
            warn!(path, error = %e, "cache write failed");
        }
    }

    fn prepare(&self, q: &StorageQuery) -> Result<Prepared> {
        let network = self.resolve_network(q.network.as_deref());
        let mut params = q.params.clone();
        if let Some(id) = self.resolve_partition(&network, &q.partition)? {
            params.insert(0, json!(id));
        }
        let path = cache_path(&network, &q.module, &q.name, &params);
        Ok(Prepared {
            network,
            params,
            path,
        })
    }

    fn block_hash_for(&self, conn: &dyn ChainConnection, q: &StorageQuery) -> Result<Option<String>> {
        match q.block {
            Some(n) => conn
                .get_block_hash(n)
                .map(Some)
                .map_err(|e| chain_error(&q.module, &q.name, e)),
            None => Ok(None),
        }
    }

    /// Subnet id for a partition, or `None` when no partition parameter
    /// applies.
    pub fn resolve_partition(&self, network: &str, partition: &Partition) -> Result<Option<u16>> {
        match partition {
            Partition::Global | Partition::All => Ok(None),
            Partition::Id(id) => Ok(Some(*id)),
            Partition::Named(name) => self
                .subnet_names(network, None, true)?
                .into_iter()
                .find(|(_, n)| n == name)
                .map(|(id, _)| Some(id))
                .ok_or_else(|| ClientError::UnknownPartition(name.clone())),
        }
    }

    /// Netuid to subnet name, at `block` or the head.
    pub fn subnet_names(
        &self,
        network: &str,
        block: Option<u64>,
        use_cache: bool,
    ) -> Result<BTreeMap<u16, String>> {
        let q = StorageQuery::item(StorageItem::SubnetNames)
            .on(network)
            .at_block(block);
        let map = self.query_map(&q, use_cache)?;
        Ok(map
            .values()
            .filter_map(|(k, v)| {
                k.as_int()
                    .and_then(|id| u16::try_from(id).ok())
                    .map(|id| (id, decode_text(v)))
            })
            .collect())
    }

    /// Header at `block`, or the head.
    pub fn block_header(&self, network: &str, block: Option<u64>) -> Result<BlockHeader> {
        let conn = self.connections.connection(network)?;
        match block {
            Some(n) => {
                let hash = conn.get_block_hash(n)?;
                Ok(BlockHeader { number: n, hash })
            }
            None => conn.get_block(None),
        }
    }

    pub fn block_number(&self, network: &str) -> Result<u64> {
        Ok(self.block_header(network, None)?.number)
    }
}

fn retryable_read(err: &ClientError) -> bool {
    err.is_transient() && !matches!(err, ClientError::Connection { .. })
}

fn chain_error(module: &str, name: &str, err: ClientError) -> ClientError {
    match err {
        ClientError::Rpc { .. } | ClientError::Transport(_) => ClientError::query(module, name, err),
        other => other,
    }
}
