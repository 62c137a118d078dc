//! Bounded fan-out of independent reads.
//!
//! Jobs run on a dedicated `rayon` pool and report through a channel, so
//! results are collected in completion order. A job that errors or panics
//! is resubmitted in the next round, unless the error is a caller
//! validation error; one failure never aborts its siblings. Whatever is
//! still unresolved when the rounds or the deadline run out is returned
//! as outstanding.

use metrics::increment_counter;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::error::{ClientError, Result};

/// A re-runnable unit of work.
pub type Job<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

pub fn job<T, F>(f: F) -> Job<T>
where
    F: Fn() -> Result<T> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug)]
pub struct FetchOutcome<K: Ord, T> {
    pub results: BTreeMap<K, T>,
    /// Unresolved keys with their last error, if any ran to completion.
    pub outstanding: BTreeMap<K, Option<String>>,
    /// Resubmissions after the first round.
    pub retries: usize,
}

impl<K: Ord + Debug, T> FetchOutcome<K, T> {
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// All results, or [`ClientError::Incomplete`] naming what is missing.
    pub fn into_complete(self) -> Result<BTreeMap<K, T>> {
        if self.outstanding.is_empty() {
            Ok(self.results)
        } else {
            Err(ClientError::Incomplete(
                self.outstanding.keys().map(|k| format!("{k:?}")).collect(),
            ))
        }
    }
}

pub struct FetchCoordinator {
    pool: ThreadPool,
    max_rounds: usize,
    default_timeout: Duration,
}

impl FetchCoordinator {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("subspace-fetch-{i}"))
            .build()
            .map_err(|e| ClientError::Config(format!("fetch pool: {e}")))?;
        Ok(Self {
            pool,
            max_rounds: config.max_rounds.max(1),
            default_timeout: config.timeout(),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs every job, retrying failures in later rounds, until all resolve,
    /// `max_rounds` is reached or `timeout` elapses.
    pub fn fetch_many<K, T>(&self, jobs: Vec<(K, Job<T>)>, timeout: Duration) -> FetchOutcome<K, T>
    where
        K: Ord + Clone + Debug + Send + 'static,
        T: Send + 'static,
    {
        // Nested fan-out from a pool worker would block the worker on its
        // own queue.
        if self.pool.current_thread_index().is_some() {
            return self.fetch_inline(jobs, timeout);
        }

        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel::<(usize, Result<T>)>();
        let mut slots: Vec<Option<T>> = jobs.iter().map(|_| None).collect();
        let mut last_error: BTreeMap<usize, String> = BTreeMap::new();
        let mut pending: BTreeSet<usize> = (0..jobs.len()).collect();
        let mut retries = 0;

        'rounds: for round in 0..self.max_rounds {
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                retries += pending.len();
                increment_counter!("subspace_fetch_retry_total");
                debug!(round, retry = pending.len(), "resubmitting failed fetches");
            }
            let mut in_flight = pending.len();
            for idx in std::mem::take(&mut pending) {
                let work = Arc::clone(&jobs[idx].1);
                let tx = tx.clone();
                self.pool.spawn(move || {
                    let _ = tx.send((idx, run_guarded(&work)));
                });
            }
            while in_flight > 0 {
                let now = Instant::now();
                if now >= deadline {
                    break 'rounds;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok((idx, Ok(value))) => {
                        in_flight -= 1;
                        last_error.remove(&idx);
                        slots[idx] = Some(value);
                    }
                    Ok((idx, Err(err))) => {
                        in_flight -= 1;
                        warn!(key = ?jobs[idx].0, error = %err, "fetch failed");
                        last_error.insert(idx, err.to_string());
                        if !err.is_validation() {
                            pending.insert(idx);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                        break 'rounds;
                    }
                }
            }
        }

        collect(jobs, slots, last_error, retries)
    }

    fn fetch_inline<K, T>(&self, jobs: Vec<(K, Job<T>)>, timeout: Duration) -> FetchOutcome<K, T>
    where
        K: Ord + Clone + Debug,
    {
        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<T>> = jobs.iter().map(|_| None).collect();
        let mut last_error = BTreeMap::new();
        let mut rejected: BTreeSet<usize> = BTreeSet::new();
        let mut retries = 0;
        for round in 0..self.max_rounds {
            let pending: Vec<usize> = (0..jobs.len())
                .filter(|i| slots[*i].is_none() && !rejected.contains(i))
                .collect();
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                retries += pending.len();
            }
            for idx in pending {
                if Instant::now() >= deadline {
                    return collect(jobs, slots, last_error, retries);
                }
                match run_guarded(&jobs[idx].1) {
                    Ok(value) => {
                        last_error.remove(&idx);
                        slots[idx] = Some(value);
                    }
                    Err(err) => {
                        warn!(key = ?jobs[idx].0, error = %err, "fetch failed");
                        if err.is_validation() {
                            rejected.insert(idx);
                        }
                        last_error.insert(idx, err.to_string());
                    }
                }
            }
        }
        collect(jobs, slots, last_error, retries)
    }

    /// Bulk form: runs `f` once per partition.
    pub fn fetch_partitions<T, F>(&self, partitions: &[u16], timeout: Duration, f: F) -> FetchOutcome<u16, T>
    where
        T: Send + 'static,
        F: Fn(u16) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let jobs = partitions
            .iter()
            .map(|&id| {
                let f = Arc::clone(&f);
                (id, job(move || f(id)))
            })
            .collect();
        self.fetch_many(jobs, timeout)
    }
}

fn run_guarded<T>(work: &Job<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(|| work())) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job panicked".to_string());
            Err(ClientError::Query {
                module: "fetch".into(),
                name: "job".into(),
                reason: msg,
            })
        }
    }
}

fn collect<K: Ord, T>(
    jobs: Vec<(K, Job<T>)>,
    slots: Vec<Option<T>>,
    mut last_error: BTreeMap<usize, String>,
    retries: usize,
) -> FetchOutcome<K, T> {
    let mut results = BTreeMap::new();
    let mut outstanding = BTreeMap::new();
    for (idx, ((key, _), slot)) in jobs.into_iter().zip(slots).enumerate() {
        match slot {
            Some(value) => {
                results.insert(key, value);
            }
            None => {
                outstanding.insert(key, last_error.remove(&idx));
            }
        }
    }
    FetchOutcome {
        results,
        outstanding,
        retries,
    }
}
