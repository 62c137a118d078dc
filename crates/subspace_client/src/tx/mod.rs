//! Composing, signing and submitting extrinsics.

mod call;
mod record;

pub use call::{Call, CallArg, SUDO_MODULE};
pub use record::{history_dir, next_start_time, HistoryKind, TxLifecycle, TxRecord, TxStatus};

use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::DiskCache;
use crate::connection::{ConnectionManager, ExtrinsicReceipt};
use crate::error::Result;
use crate::signer::Signer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOptions {
    pub network: Option<String>,
    pub sudo: bool,
    pub unchecked_weight: bool,
    pub wait_for_inclusion: bool,
    pub wait_for_finalization: bool,
    pub nonce: Option<u64>,
    pub tip: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            network: None,
            sudo: false,
            unchecked_weight: false,
            wait_for_inclusion: true,
            wait_for_finalization: true,
            nonce: None,
            tip: 0,
        }
    }
}

impl TxOptions {
    pub fn on(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn unchecked_weight(mut self) -> Self {
        self.unchecked_weight = true;
        self
    }

    /// Returns as soon as the node accepts the extrinsic.
    pub fn no_wait(mut self) -> Self {
        self.wait_for_inclusion = false;
        self.wait_for_finalization = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub record_id: String,
}

pub struct TransactionComposer {
    connections: Arc<ConnectionManager>,
    cache: Arc<DiskCache>,
}

impl TransactionComposer {
    pub fn new(connections: Arc<ConnectionManager>, cache: Arc<DiskCache>) -> Self {
        Self { connections, cache }
    }

    /// Validates, wraps, signs and submits `call`.
    ///
    /// Invalid arguments are returned as `Err` before anything is written.
    /// Once the pending record exists every outcome, including connection
    /// and chain failures, is reported through [`TxResult::success`].
    pub fn compose_call(&self, call: Call, signer: &dyn Signer, options: &TxOptions) -> Result<TxResult> {
        call.validate()?;
        let mut call = call;
        if options.sudo {
            call = call.sudo();
        }
        if options.unchecked_weight {
            call = call.unchecked_weight();
        }
        let payload = call.to_payload()?;
        let network = options
            .network
            .clone()
            .unwrap_or_else(|| self.connections.default_network().to_string());
        let id = uuid::Uuid::new_v4().to_string();
        let _span = crate::log_context!(tx = id).entered();
        let address = signer.address();

        let lifecycle = TxLifecycle::begin(
            Arc::clone(&self.cache),
            &id,
            &network,
            &address,
            call.describe(),
            payload.clone(),
        )?;
        info!(call = %call.describe(), %network, signer = %address, "submitting extrinsic");

        let outcome = settle(self.submit(&network, &payload, signer, options), options);
        let Settled {
            success,
            message,
            tx_hash,
            error,
            response,
        } = outcome;
        let record = lifecycle.complete(success, response).map_err(|e| {
            error!(id = %id, error = %e, "transaction record left pending");
            e
        })?;
        if success {
            increment_counter!("subspace_tx_success_total");
        } else {
            increment_counter!("subspace_tx_failure_total");
        }
        info!(success, status = ?record.status, "extrinsic complete");
        Ok(TxResult {
            success,
            message,
            tx_hash,
            error,
            record_id: record.id,
        })
    }

    fn submit(
        &self,
        network: &str,
        payload: &Value,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<ExtrinsicReceipt> {
        let conn = self.connections.connection(network)?;
        let extrinsic = conn.create_signed_extrinsic(payload, signer, options.nonce, options.tip)?;
        conn.submit_extrinsic(
            &extrinsic,
            options.wait_for_inclusion,
            options.wait_for_finalization,
        )
    }

    /// Records of `signer`, newest first.
    pub fn history(&self, network: Option<&str>, signer: &str, kind: HistoryKind) -> Result<Vec<TxRecord>> {
        let network = network.unwrap_or_else(|| self.connections.default_network());
        record::history(&self.cache, network, signer, kind)
    }

    /// Finishes moving records left behind by an interrupted completion.
    pub fn recover(&self, network: Option<&str>, signer: &str) -> Result<usize> {
        let network = network.unwrap_or_else(|| self.connections.default_network());
        record::recover(&self.cache, network, signer)
    }
}

struct Settled {
    success: bool,
    message: String,
    tx_hash: Option<String>,
    error: Option<String>,
    response: Value,
}

/// Folds a submission result into the terminal outcome. Never fails, so a
/// record that reached `pending/` is always completed.
fn settle(submitted: Result<ExtrinsicReceipt>, options: &TxOptions) -> Settled {
    match submitted {
        Ok(receipt) => {
            let (success, message) = interpret(&receipt, options);
            let response = serde_json::to_value(&receipt)
                .unwrap_or_else(|e| json!({ "error": format!("unencodable receipt: {e}") }));
            Settled {
                error: (!success).then(|| message.clone()),
                success,
                message,
                tx_hash: Some(receipt.extrinsic_hash),
                response,
            }
        }
        Err(err) => {
            warn!(error = %err, "extrinsic submission failed");
            let message = err.to_string();
            Settled {
                success: false,
                tx_hash: None,
                error: Some(message.clone()),
                response: json!({ "error": message }),
                message,
            }
        }
    }
}

fn interpret(receipt: &ExtrinsicReceipt, options: &TxOptions) -> (bool, String) {
    if !options.wait_for_finalization {
        return (true, "submitted, not waiting for finalization".to_string());
    }
    if receipt.is_success {
        (true, "finalized".to_string())
    } else {
        let reason = receipt
            .error_message
            .clone()
            .unwrap_or_else(|| "extrinsic failed".to_string());
        (false, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_counts_as_success_without_finalization() {
        let receipt = ExtrinsicReceipt {
            is_success: false,
            ..Default::default()
        };
        let (ok, _) = interpret(&receipt, &TxOptions::default().no_wait());
        assert!(ok);
        let (ok, msg) = interpret(&receipt, &TxOptions::default());
        assert!(!ok);
        assert_eq!(msg, "extrinsic failed");
    }

    #[test]
    fn every_submission_result_settles() {
        let receipt = ExtrinsicReceipt {
            extrinsic_hash: "0xab".into(),
            is_success: true,
            ..Default::default()
        };
        let done = settle(Ok(receipt), &TxOptions::default());
        assert!(done.success);
        assert_eq!(done.tx_hash.as_deref(), Some("0xab"));
        assert_eq!(done.response["extrinsic_hash"], "0xab");
        assert!(done.error.is_none());

        let refused = settle(
            Err(crate::error::ClientError::Submission("pool full".into())),
            &TxOptions::default(),
        );
        assert!(!refused.success);
        assert!(refused.tx_hash.is_none());
        assert_eq!(refused.error.as_deref(), Some(refused.message.as_str()));
        assert!(refused.response["error"].as_str().unwrap().contains("pool full"));
    }
}
