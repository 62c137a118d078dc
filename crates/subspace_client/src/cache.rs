//! Path-keyed JSON cache on local disk.
//!
//! A key such as `query/main/SubspaceModule.Tempo::params::0` maps to
//! `<root>/query/main/SubspaceModule.Tempo::params::0.json`. Values are
//! wrapped in an envelope carrying the write time so callers can ask for a
//! maximum age. Every write goes through [`write_atomic`], so readers never
//! observe a half-written entry; concurrent writers of one key are
//! last-writer-wins.

use metrics::increment_counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

const ENTRY_EXT: &str = "json";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    written_at: u64,
    value: T,
}

#[derive(Clone, Debug)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ENTRY_EXT}"))
    }

    fn dir_for(&self, dir_key: &str) -> PathBuf {
        if dir_key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir_key)
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let envelope = Envelope {
            written_at: unix_now(),
            value,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        write_atomic(&self.path_for(key), &bytes)?;
        debug!(key, bytes = bytes.len(), "cache write");
        Ok(())
    }

    /// Reads `key`. A missing entry is `Ok(None)`; an undecodable one is
    /// [`ClientError::CacheCorruption`].
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.read_envelope(key)?.map(|env| env.value))
    }

    /// Reads `key`, treating corruption as a miss. Corrupt entries are
    /// removed so the next write starts clean.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup_envelope(key).map(|env| env.value)
    }

    /// Like [`DiskCache::lookup`] but ignores entries older than `max_age`.
    pub fn lookup_fresh<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<T> {
        let env = self.lookup_envelope::<T>(key)?;
        let age = unix_now().saturating_sub(env.written_at);
        if age <= max_age.as_secs() {
            Some(env.value)
        } else {
            debug!(key, age, "cache entry stale");
            None
        }
    }

    fn lookup_envelope<T: DeserializeOwned>(&self, key: &str) -> Option<Envelope<T>> {
        match self.read_envelope(key) {
            Ok(Some(env)) => {
                increment_counter!("subspace_cache_hit_total");
                Some(env)
            }
            Ok(None) => {
                increment_counter!("subspace_cache_miss_total");
                None
            }
            Err(err) => {
                increment_counter!("subspace_cache_corrupt_total");
                warn!(key, error = %err, "discarding unreadable cache entry");
                let _ = fs::remove_file(self.path_for(key));
                None
            }
        }
    }

    fn read_envelope<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Envelope<T>>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ClientError::CacheCorruption {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Removes `key`, returning whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically moves an entry to a new key.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.path_for(to);
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        fs::rename(self.path_for(from), &target)?;
        Ok(sync_dir(dir)?)
    }

    /// Keys of the entries directly under `dir_key`, sorted.
    pub fn list(&self, dir_key: &str) -> Result<Vec<String>> {
        let dir = self.dir_for(dir_key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(if dir_key.is_empty() {
                    stem.to_string()
                } else {
                    format!("{dir_key}/{stem}")
                });
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Removes every entry under `dir_key`.
    pub fn clear(&self, dir_key: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir_for(dir_key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Replaces `path` with `bytes`. Readers see the old or the new contents,
/// never a partial file. Each call stages into its own sibling file, so
/// concurrent writers of one path do not collide.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let staged = staging_path(path);
    let replaced = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&staged, path));
    if let Err(e) = replaced {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    sync_dir(dir)
}

fn staging_path(path: &Path) -> PathBuf {
    let writer = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}-{writer}.partial", std::process::id()));
    PathBuf::from(name)
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
