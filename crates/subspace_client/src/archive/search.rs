use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ArchiveStore;
use crate::amount::from_base_units;
use crate::error::{ClientError, Result};

/// Aggregates of one sampled snapshot, in display units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRow {
    pub block: u64,
    pub timestamp: u64,
    pub total_balance: f64,
    pub total_stake: f64,
    pub market_cap: f64,
    /// Market cap change per block since the previous row, measured over
    /// whole tempo periods. Zero for the first row.
    pub value_change_per_block: f64,
}

impl ArchiveStore {
    /// Samples at most roughly `sample_count` snapshots with timestamps in
    /// `[start, end]` and returns one row per sample, oldest first.
    pub fn search(
        &self,
        network: Option<&str>,
        start: u64,
        end: u64,
        sample_count: usize,
        netuid: u16,
    ) -> Result<Vec<SearchRow>> {
        if end <= start {
            return Err(ClientError::invalid(
                "end",
                format!("end {end} must be after start {start}"),
            ));
        }
        if sample_count == 0 {
            return Err(ClientError::invalid("sample_count", "must be positive"));
        }
        let mut entries = self.entries(network)?;
        entries.retain(|e| e.timestamp >= start && e.timestamp <= end);
        entries.sort_by_key(|e| e.timestamp);
        let step = (entries.len() / sample_count).max(1);
        debug!(candidates = entries.len(), step, "searching archive");

        let mut rows: Vec<SearchRow> = Vec::new();
        for entry in entries.iter().step_by(step) {
            let Some(snapshot) = self.load_logged(entry) else {
                continue;
            };
            let total_balance = from_base_units(snapshot.total_balance());
            let total_stake = from_base_units(snapshot.total_stake(Some(netuid)));
            let market_cap = total_balance + total_stake;
            let tempo = snapshot.tempo(netuid);
            let value_change_per_block = match rows.last() {
                Some(prev) => {
                    let periods = (snapshot.block / tempo).saturating_sub(prev.block / tempo);
                    let blocks = periods * tempo;
                    if blocks > 0 {
                        (market_cap - prev.market_cap) / blocks as f64
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            rows.push(SearchRow {
                block: snapshot.block,
                timestamp: entry.timestamp,
                total_balance,
                total_stake,
                market_cap,
                value_change_per_block,
            });
        }
        Ok(rows)
    }
}
