//! Point-in-time snapshots of full chain state, kept outside the live cache.
//!
//! Each snapshot is one JSON file named `{network}.block-{N}-time-{T}.json`
//! under the archive directory. Files are immutable once written; an
//! unreadable file is treated as absent by every reader.

mod migrate;
mod search;

pub use migrate::migrate_snapshot;
pub use search::SearchRow;

use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{unix_now, write_atomic};
use crate::error::{ClientError, Result};
use crate::features::{self, FeatureRegistry};
use crate::fetch::job;
use crate::modules::ModuleRecord;
use crate::state::{ChainState, GlobalParams, ReadOpts, SubnetParams};

pub const SNAPSHOT_VERSION: u32 = 4;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub version: u32,
    pub network: String,
    pub block: u64,
    #[serde(default)]
    pub block_hash: String,
    pub timestamp: u64,
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
    #[serde(default)]
    pub modules: BTreeMap<u16, Vec<ModuleRecord>>,
    #[serde(default)]
    pub subnets: BTreeMap<u16, SubnetParams>,
    #[serde(default)]
    pub global: GlobalParams,
}

impl ArchiveSnapshot {
    pub fn total_balance(&self) -> u64 {
        self.balances.values().sum()
    }

    /// Stake held by the modules of `netuid`, or of every subnet.
    pub fn total_stake(&self, netuid: Option<u16>) -> u64 {
        self.modules
            .iter()
            .filter(|(id, _)| netuid.map_or(true, |n| n == **id))
            .flat_map(|(_, records)| records.iter())
            .map(|m| m.stake)
            .sum()
    }

    pub fn tempo(&self, netuid: u16) -> u64 {
        self.subnets.get(&netuid).map(|s| s.tempo).unwrap_or(0).max(1)
    }
}

/// A snapshot file as seen through its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub block: u64,
    pub timestamp: u64,
    pub path: PathBuf,
}

pub fn file_name(network: &str, block: u64, timestamp: u64) -> String {
    format!("{network}.block-{block}-time-{timestamp}.json")
}

/// `(block, timestamp)` encoded in a snapshot file name of `network`.
pub fn parse_file_name(network: &str, name: &str) -> Option<(u64, u64)> {
    let rest = name
        .strip_prefix(network)?
        .strip_prefix(".block-")?
        .strip_suffix(".json")?;
    let (block, time) = rest.split_once("-time-")?;
    Some((block.parse().ok()?, time.parse().ok()?))
}

fn snapshot_field(feature: &str) -> Option<&'static str> {
    match feature {
        features::BALANCES => Some("balances"),
        features::SUBNET_PARAMS => Some("subnets"),
        features::GLOBAL_PARAMS => Some("global"),
        features::MODULES => Some("modules"),
        _ => None,
    }
}

pub struct ArchiveStore {
    dir: PathBuf,
    state: ChainState,
    features: Arc<FeatureRegistry>,
}

impl ArchiveStore {
    pub fn new(dir: impl Into<PathBuf>, state: ChainState, features: Arc<FeatureRegistry>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            state,
            features,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn network(&self, network: Option<&str>) -> String {
        self.state.engine().resolve_network(network)
    }

    /// Captures `selector` (every snapshot feature when empty) at the
    /// current head and writes it atomically.
    pub fn snapshot(&self, network: Option<&str>, selector: &[&str]) -> Result<ArchiveSnapshot> {
        let network = self.network(network);
        let _span = crate::log_context!(snapshot = network).entered();
        let selected: Vec<&'static str> = if selector.is_empty() {
            features::SNAPSHOT_FEATURES.to_vec()
        } else {
            selector
                .iter()
                .map(|name| {
                    features::SNAPSHOT_FEATURES
                        .iter()
                        .copied()
                        .find(|f| f == name)
                        .ok_or_else(|| {
                            ClientError::invalid("selector", format!("{name} is not a snapshot feature"))
                        })
                })
                .collect::<Result<_>>()?
        };

        let header = self.state.engine().block_header(&network, None)?;
        let opts = ReadOpts::fresh().on(network.clone()).at_block(header.number);
        let jobs = selected
            .iter()
            .map(|&name| {
                let handler = self.features.handler(name)?;
                let state = self.state.clone();
                let opts = opts.clone();
                Ok((name, job(move || handler(&state, &opts))))
            })
            .collect::<Result<Vec<_>>>()?;
        let results = self
            .state
            .fetcher()
            .fetch_many(jobs, self.state.fetcher().default_timeout())
            .into_complete()?;

        let mut doc = Map::new();
        for (feature, value) in results {
            if let Some(field) = snapshot_field(feature) {
                doc.insert(field.to_string(), value);
            }
        }
        let timestamp = unix_now();
        doc.insert("version".into(), SNAPSHOT_VERSION.into());
        doc.insert("network".into(), network.clone().into());
        doc.insert("block".into(), header.number.into());
        doc.insert("block_hash".into(), header.hash.into());
        doc.insert("timestamp".into(), timestamp.into());
        let snapshot: ArchiveSnapshot = serde_json::from_value(Value::Object(doc))?;

        let path = self.dir.join(file_name(&network, snapshot.block, timestamp));
        write_atomic(&path, &serde_json::to_vec(&snapshot)?)?;
        increment_counter!("subspace_archive_snapshot_total");
        info!(
            block = snapshot.block,
            path = %path.display(),
            features = selected.len(),
            "snapshot written"
        );
        Ok(snapshot)
    }

    /// Snapshot files of `network` ordered by block, then timestamp.
    pub fn entries(&self, network: Option<&str>) -> Result<Vec<ArchiveEntry>> {
        let network = self.network(network);
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries: Vec<ArchiveEntry> = dir
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let (block, timestamp) = parse_file_name(&network, name.to_str()?)?;
                Some(ArchiveEntry {
                    block,
                    timestamp,
                    path: entry.path(),
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.block, e.timestamp));
        Ok(entries)
    }

    /// Block numbers with a snapshot.
    pub fn list_snapshots(&self, network: Option<&str>, descending: bool) -> Result<Vec<u64>> {
        let mut blocks: Vec<u64> = self.entries(network)?.into_iter().map(|e| e.block).collect();
        blocks.dedup();
        if descending {
            blocks.reverse();
        }
        Ok(blocks)
    }

    pub fn load(&self, path: &Path) -> Result<ArchiveSnapshot> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::CacheCorruption {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn load_logged(&self, entry: &ArchiveEntry) -> Option<ArchiveSnapshot> {
        match self.load(&entry.path) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(path = %entry.path.display(), error = %err, "skipping unreadable snapshot");
                None
            }
        }
    }

    /// Newest readable snapshot at `block`.
    pub fn load_block(&self, network: Option<&str>, block: u64) -> Result<Option<ArchiveSnapshot>> {
        Ok(self
            .entries(network)?
            .iter()
            .rev()
            .filter(|e| e.block == block)
            .find_map(|e| self.load_logged(e)))
    }

    /// Newest readable snapshot by timestamp.
    pub fn latest(&self, network: Option<&str>) -> Result<Option<ArchiveSnapshot>> {
        let mut entries = self.entries(network)?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries.iter().rev().find_map(|e| self.load_logged(e)))
    }

    pub fn latest_block(&self, network: Option<&str>) -> Result<Option<u64>> {
        Ok(self.entries(network)?.last().map(|e| e.block))
    }

    /// Blocks the newest snapshot trails the chain head by.
    pub fn lag(&self, network: Option<&str>) -> Result<Option<u64>> {
        let Some(latest) = self.latest_block(network)? else {
            return Ok(None);
        };
        let head = self.state.engine().block_number(&self.network(network))?;
        Ok(Some(head.saturating_sub(latest)))
    }

    /// Removes snapshots older than `retention`. The newest snapshot is
    /// always kept.
    pub fn prune(&self, network: Option<&str>, retention: Duration) -> Result<usize> {
        let mut entries = self.entries(network)?;
        entries.sort_by_key(|e| e.timestamp);
        let Some(newest) = entries.pop() else {
            return Ok(0);
        };
        let cutoff = unix_now().saturating_sub(retention.as_secs());
        let mut removed = 0;
        for entry in entries.iter().filter(|e| e.timestamp < cutoff) {
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            info!(removed, kept_block = newest.block, "pruned snapshots");
        }
        Ok(removed)
    }

    /// Groups snapshots into runs of one chain lifetime. A block number
    /// lower than its predecessor in time order marks a chain restart.
    pub fn chain_segments(&self, network: Option<&str>) -> Result<Vec<Vec<ArchiveEntry>>> {
        let mut entries = self.entries(network)?;
        entries.sort_by_key(|e| e.timestamp);
        let mut segments: Vec<Vec<ArchiveEntry>> = Vec::new();
        for entry in entries {
            match segments.last_mut() {
                Some(current) if current.last().map_or(false, |prev| entry.block >= prev.block) => {
                    current.push(entry)
                }
                _ => segments.push(vec![entry]),
            }
        }
        Ok(segments)
    }

    /// Pure schema transform of a snapshot document; see [`migrate_snapshot`].
    pub fn migrate(value: Value, from: u32, to: u32) -> Result<Value> {
        migrate_snapshot(value, from, to)
    }

    /// Rewrites the snapshot document at `path` from version `from` to `to`.
    pub fn migrate_file(path: &Path, from: u32, to: u32) -> Result<Value> {
        let bytes = fs::read(path)?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ClientError::CacheCorruption {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let migrated = migrate_snapshot(value, from, to)?;
        write_atomic(path, &serde_json::to_vec(&migrated)?)?;
        info!(path = %path.display(), from, to, "snapshot migrated");
        Ok(migrated)
    }
}
