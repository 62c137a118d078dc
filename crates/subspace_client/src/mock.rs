//! In-memory chain used by tests and local tooling.
//!
//! [`MockChain`] keeps storage as `(module, name) -> [(key, value)]`, counts
//! every call and can be told to fail the next N reads, opens or
//! submissions.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{
    BlockHeader, ChainConnection, Connector, ExtrinsicReceipt, SignedExtrinsic, StorageEntry,
};
use crate::error::{ClientError, Result};

type SubmitHook = Box<dyn Fn(&SignedExtrinsic) + Send + Sync>;

pub struct MockChain {
    url: String,
    storage: Mutex<HashMap<(String, String), Vec<StorageEntry>>>,
    block: AtomicU64,
    nonces: Mutex<HashMap<String, u64>>,
    query_calls: AtomicUsize,
    query_map_calls: AtomicUsize,
    map_reads: Mutex<Vec<(String, Option<String>)>>,
    fail_next_reads: AtomicUsize,
    item_failures: Mutex<HashMap<String, usize>>,
    submitted: Mutex<Vec<SignedExtrinsic>>,
    reject_next: Mutex<Option<String>>,
    fail_next_submit: AtomicUsize,
    on_submit: Mutex<Option<SubmitHook>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            url: "mock://chain".to_string(),
            storage: Mutex::new(HashMap::new()),
            block: AtomicU64::new(1),
            nonces: Mutex::new(HashMap::new()),
            query_calls: AtomicUsize::new(0),
            query_map_calls: AtomicUsize::new(0),
            map_reads: Mutex::new(Vec::new()),
            fail_next_reads: AtomicUsize::new(0),
            item_failures: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            reject_next: Mutex::new(None),
            fail_next_submit: AtomicUsize::new(0),
            on_submit: Mutex::new(None),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, module: &str, name: &str, key: Vec<Value>, value: Value) {
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let entries = storage
            .entry((module.to_string(), name.to_string()))
            .or_default();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn clear_item(&self, module: &str, name: &str) {
        self.storage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(module.to_string(), name.to_string()));
    }

    pub fn set_block(&self, number: u64) {
        self.block.store(number, Ordering::SeqCst);
    }

    pub fn block_number(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn query_map_calls(&self) -> usize {
        self.query_map_calls.load(Ordering::SeqCst)
    }

    /// Block hashes the map reads of `name` were pinned to, in call order.
    pub fn map_reads_of(&self, name: &str) -> Vec<Option<String>> {
        self.map_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(item, _)| item == name)
            .map(|(_, hash)| hash.clone())
            .collect()
    }

    /// Fails the next `n` reads of any item.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_next_reads.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` reads of storage item `name`.
    pub fn fail_item(&self, name: &str, n: usize) {
        self.item_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), n);
    }

    /// The next submission is included but fails on chain with `message`.
    pub fn reject_next_submission(&self, message: &str) {
        *self.reject_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    /// The next `n` submissions fail at the transport.
    pub fn fail_next_submissions(&self, n: usize) {
        self.fail_next_submit.store(n, Ordering::SeqCst);
    }

    pub fn on_submit(&self, hook: impl Fn(&SignedExtrinsic) + Send + Sync + 'static) {
        *self.on_submit.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    pub fn submitted(&self) -> Vec<SignedExtrinsic> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_read(&self, module: &str, name: &str) -> Result<()> {
        if Self::take(&self.fail_next_reads) {
            return Err(ClientError::Rpc {
                code: -32000,
                message: format!("injected failure reading {module}.{name}"),
            });
        }
        let mut failures = self.item_failures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = failures.get_mut(name) {
            if *n > 0 {
                *n -= 1;
                return Err(ClientError::Rpc {
                    code: -32000,
                    message: format!("injected failure reading {module}.{name}"),
                });
            }
        }
        Ok(())
    }

    pub fn hash_of(number: u64) -> String {
        format!("0x{number:064x}")
    }
}

impl ChainConnection for MockChain {
    fn url(&self) -> &str {
        &self.url
    }

    fn query(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        _block_hash: Option<&str>,
    ) -> Result<Value> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check_read(module, name)?;
        let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        Ok(storage
            .get(&(module.to_string(), name.to_string()))
            .and_then(|entries| entries.iter().find(|(k, _)| k.as_slice() == params))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null))
    }

    fn query_map(
        &self,
        module: &str,
        name: &str,
        params: &[Value],
        _page_size: u32,
        max_results: usize,
        block_hash: Option<&str>,
    ) -> Result<Vec<StorageEntry>> {
        self.query_map_calls.fetch_add(1, Ordering::SeqCst);
        self.map_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), block_hash.map(str::to_string)));
        self.check_read(module, name)?;
        let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let entries = storage
            .get(&(module.to_string(), name.to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(k, _)| k.len() > params.len() && k.starts_with(params))
                    .map(|(k, v)| (k[params.len()..].to_vec(), v.clone()))
                    .take(max_results)
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    fn get_block(&self, hash: Option<&str>) -> Result<BlockHeader> {
        let number = match hash {
            None => self.block_number(),
            Some(h) => u64::from_str_radix(h.trim_start_matches("0x"), 16).map_err(|_| {
                ClientError::Rpc {
                    code: -32602,
                    message: format!("unknown block {h}"),
                }
            })?,
        };
        Ok(BlockHeader {
            number,
            hash: Self::hash_of(number),
        })
    }

    fn get_block_hash(&self, number: u64) -> Result<String> {
        Ok(Self::hash_of(number))
    }

    fn account_nonce(&self, address: &str) -> Result<u64> {
        Ok(*self
            .nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .unwrap_or(&0))
    }

    fn submit_extrinsic(
        &self,
        extrinsic: &SignedExtrinsic,
        _wait_for_inclusion: bool,
        wait_for_finalization: bool,
    ) -> Result<ExtrinsicReceipt> {
        if let Some(hook) = self
            .on_submit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            hook(extrinsic);
        }
        if Self::take(&self.fail_next_submit) {
            return Err(ClientError::Submission("injected submission failure".into()));
        }
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(extrinsic.clone());
        *self
            .nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(extrinsic.signer.clone())
            .or_insert(0) += 1;
        let rejection = self.reject_next.lock().unwrap_or_else(|e| e.into_inner()).take();
        let block = self.block_number();
        Ok(ExtrinsicReceipt {
            extrinsic_hash: extrinsic.hash(),
            block_hash: wait_for_finalization.then(|| Self::hash_of(block)),
            is_success: rejection.is_none(),
            error_message: rejection,
            events: Vec::new(),
        })
    }
}

/// Hands out one shared [`MockChain`] and counts opens.
pub struct MockConnector {
    chain: Arc<MockChain>,
    opens: AtomicUsize,
    fail_opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            opens: AtomicUsize::new(0),
            fail_opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str) -> Result<Arc<dyn ChainConnection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if MockChain::take(&self.fail_opens) {
            return Err(ClientError::Connection {
                target: url.to_string(),
                attempts: 1,
                reason: "injected open failure".into(),
            });
        }
        Ok(Arc::clone(&self.chain) as Arc<dyn ChainConnection>)
    }
}
