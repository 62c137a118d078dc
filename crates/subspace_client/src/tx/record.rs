//! Durable transaction records.
//!
//! A record lives at `history/{network}/{signer}/pending/{start}` while the
//! extrinsic is in flight. Completion first rewrites that file with the
//! terminal status, then renames it into `complete/`, so at every instant
//! exactly one file is authoritative for the transaction.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::cache::DiskCache;
use crate::error::{ClientError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxStatus {
    Pending,
    CompletedSuccess,
    CompletedFailure,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryKind {
    Pending,
    Complete,
}

impl HistoryKind {
    pub fn dir(self) -> &'static str {
        match self {
            HistoryKind::Pending => "pending",
            HistoryKind::Complete => "complete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: String,
    pub network: String,
    pub signer: String,
    pub status: TxStatus,
    /// Nanoseconds since the epoch, unique within the process.
    pub start_time: u64,
    #[serde(default)]
    pub end_time: Option<u64>,
    pub description: String,
    pub call: Value,
    #[serde(default)]
    pub response: Option<Value>,
}

pub fn history_dir(network: &str, signer: &str, kind: HistoryKind) -> String {
    format!("history/{network}/{signer}/{}", kind.dir())
}

fn record_key(network: &str, signer: &str, kind: HistoryKind, start_time: u64) -> String {
    format!("{}/{start_time}", history_dir(network, signer, kind))
}

static CLOCK_BASE: Lazy<(Instant, u64)> = Lazy::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (Instant::now(), wall)
});
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing nanosecond timestamp anchored at wall-clock time.
pub fn next_start_time() -> u64 {
    let (anchor, wall) = *CLOCK_BASE;
    let now = wall.saturating_add(anchor.elapsed().as_nanos() as u64);
    let mut last = LAST_STAMP.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match LAST_STAMP.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(seen) => last = seen,
        }
    }
}

/// An in-flight transaction. Consumed by [`TxLifecycle::complete`], so a
/// record reaches a terminal state at most once.
pub struct TxLifecycle {
    cache: Arc<DiskCache>,
    record: TxRecord,
}

impl TxLifecycle {
    /// Writes the pending record.
    pub fn begin(
        cache: Arc<DiskCache>,
        id: &str,
        network: &str,
        signer: &str,
        description: String,
        call: Value,
    ) -> Result<Self> {
        let record = TxRecord {
            id: id.to_string(),
            network: network.to_string(),
            signer: signer.to_string(),
            status: TxStatus::Pending,
            start_time: next_start_time(),
            end_time: None,
            description,
            call,
            response: None,
        };
        let lifecycle = Self { cache, record };
        lifecycle.cache.put(&lifecycle.pending_key(), &lifecycle.record)?;
        debug!(key = %lifecycle.pending_key(), "pending record written");
        Ok(lifecycle)
    }

    pub fn record(&self) -> &TxRecord {
        &self.record
    }

    pub fn pending_key(&self) -> String {
        record_key(
            &self.record.network,
            &self.record.signer,
            HistoryKind::Pending,
            self.record.start_time,
        )
    }

    pub fn complete_key(&self) -> String {
        record_key(
            &self.record.network,
            &self.record.signer,
            HistoryKind::Complete,
            self.record.start_time,
        )
    }

    /// Records the terminal state and moves the record into `complete/`.
    pub fn complete(mut self, success: bool, response: Value) -> Result<TxRecord> {
        self.record.status = if success {
            TxStatus::CompletedSuccess
        } else {
            TxStatus::CompletedFailure
        };
        self.record.end_time = Some(next_start_time());
        self.record.response = Some(response);
        let pending = self.pending_key();
        self.cache.put(&pending, &self.record)?;
        self.cache.rename(&pending, &self.complete_key())?;
        Ok(self.record)
    }
}

/// Decodable records under `dir_key`. Unreadable files are logged and left
/// in place.
fn read_records(cache: &DiskCache, dir_key: &str) -> Result<Vec<(String, TxRecord)>> {
    let mut records = Vec::new();
    for key in cache.list(dir_key)? {
        match cache.get::<TxRecord>(&key) {
            Ok(Some(record)) => records.push((key, record)),
            Ok(None) => {}
            Err(ClientError::CacheCorruption { path, reason }) => {
                warn!(%path, %reason, "skipping unreadable transaction record");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Records of `signer` on `network`, newest first.
pub fn history(cache: &DiskCache, network: &str, signer: &str, kind: HistoryKind) -> Result<Vec<TxRecord>> {
    let mut records: Vec<TxRecord> = read_records(cache, &history_dir(network, signer, kind))?
        .into_iter()
        .map(|(_, record)| record)
        .collect();
    records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(records)
}

/// Moves records that reached a terminal state but were left in
/// `pending/` by an interrupted completion.
pub fn recover(cache: &DiskCache, network: &str, signer: &str) -> Result<usize> {
    let mut moved = 0;
    for (key, record) in read_records(cache, &history_dir(network, signer, HistoryKind::Pending))? {
        if record.status.is_terminal() {
            let target = record_key(network, signer, HistoryKind::Complete, record.start_time);
            cache.rename(&key, &target)?;
            warn!(id = %record.id, "recovered interrupted transaction record");
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn cache() -> (tempfile::TempDir, Arc<DiskCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
        (dir, cache)
    }

    #[test]
    fn start_times_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| next_start_time()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for stamp in h.join().unwrap() {
                assert!(seen.insert(stamp));
            }
        }
    }

    #[test]
    fn lifecycle_moves_record_to_complete() {
        let (_dir, cache) = cache();
        let tx = TxLifecycle::begin(
            Arc::clone(&cache),
            "id-1",
            "test",
            "0xabc",
            "Balances.transfer".into(),
            json!({"value": 1}),
        )
        .unwrap();
        let pending = history(&cache, "test", "0xabc", HistoryKind::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TxStatus::Pending);

        let done = tx.complete(false, json!({"error": "boom"})).unwrap();
        assert_eq!(done.status, TxStatus::CompletedFailure);
        assert!(done.end_time.unwrap() > done.start_time);
        assert!(history(&cache, "test", "0xabc", HistoryKind::Pending).unwrap().is_empty());
        let complete = history(&cache, "test", "0xabc", HistoryKind::Complete).unwrap();
        assert_eq!(complete, vec![done]);
    }

    #[test]
    fn history_is_newest_first() {
        let (_dir, cache) = cache();
        for i in 0..3 {
            let tx = TxLifecycle::begin(Arc::clone(&cache), &format!("id-{i}"), "n", "s", "M.f".into(), json!(i))
                .unwrap();
            tx.complete(true, json!(null)).unwrap();
        }
        let ids: Vec<String> = history(&cache, "n", "s", HistoryKind::Complete)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["id-2", "id-1", "id-0"]);
    }

    #[test]
    fn recover_moves_terminal_pending_records() {
        let (_dir, cache) = cache();
        let tx = TxLifecycle::begin(Arc::clone(&cache), "id", "n", "s", "M.f".into(), json!(1)).unwrap();
        let mut record = tx.record().clone();
        record.status = TxStatus::CompletedSuccess;
        cache.put(&tx.pending_key(), &record).unwrap();
        let _still_pending = TxLifecycle::begin(Arc::clone(&cache), "id2", "n", "s", "M.f".into(), json!(2)).unwrap();

        assert_eq!(recover(&cache, "n", "s").unwrap(), 1);
        assert_eq!(history(&cache, "n", "s", HistoryKind::Pending).unwrap().len(), 1);
        assert_eq!(history(&cache, "n", "s", HistoryKind::Complete).unwrap()[0].id, "id");
    }

    #[test]
    fn unreadable_records_are_skipped_and_kept() {
        let (_dir, cache) = cache();
        let tx = TxLifecycle::begin(Arc::clone(&cache), "id", "n", "s", "M.f".into(), json!(1)).unwrap();
        tx.complete(true, json!(null)).unwrap();
        let broken = format!("{}/0", history_dir("n", "s", HistoryKind::Complete));
        std::fs::write(cache.path_for(&broken), b"{ truncated").unwrap();

        let complete = history(&cache, "n", "s", HistoryKind::Complete).unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].id, "id");
        assert!(cache.exists(&broken));
        assert_eq!(recover(&cache, "n", "s").unwrap(), 0);
    }
}
