use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::amount::{from_base_units, normalize_u16};
use crate::query::{decode_text, decode_u64, MapKey, QueryMapResult};

pub const DEFAULT_DELEGATION_FEE: u64 = 20;

/// One registered module of a subnet. Amounts are base units; ratios are
/// normalised to `[0, 1]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub uid: u16,
    pub key: String,
    pub name: String,
    pub address: String,
    pub stake: u64,
    pub emission: u64,
    pub incentive: f64,
    pub dividends: f64,
    pub delegation_fee: u64,
    pub last_update: u64,
    pub registration_block: u64,
    #[serde(default)]
    pub stake_from: Vec<(String, u64)>,
}

impl ModuleRecord {
    pub fn stake_tokens(&self) -> f64 {
        from_base_units(self.stake)
    }

    pub fn emission_tokens(&self) -> f64 {
        from_base_units(self.emission)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleSort {
    Stake,
    Emission,
    Incentive,
    Dividends,
    Uid,
}

/// Per-feature columns of one subnet as read from chain.
#[derive(Clone, Debug, Default)]
pub struct ModuleColumns {
    pub keys: BTreeMap<u16, String>,
    pub names: BTreeMap<u16, String>,
    pub addresses: BTreeMap<u16, String>,
    pub registration_block: BTreeMap<u16, u64>,
    pub emission: Vec<u64>,
    pub incentive: Vec<u64>,
    pub dividends: Vec<u64>,
    pub last_update: Vec<u64>,
    pub delegation_fee: BTreeMap<String, u64>,
    pub stake_from: BTreeMap<String, Vec<(String, u64)>>,
}

/// `uid -> value` from a map keyed by uid.
pub fn uid_column<T>(map: &QueryMapResult, decode: impl Fn(&Value) -> T) -> BTreeMap<u16, T> {
    map.values()
        .filter_map(|(k, v)| {
            k.as_int()
                .and_then(|uid| u16::try_from(uid).ok())
                .map(|uid| (uid, decode(v)))
        })
        .collect()
}

/// `key -> value` from a map keyed by account.
pub fn key_column<T>(map: &QueryMapResult, decode: impl Fn(&Value) -> T) -> BTreeMap<String, T> {
    map.values().map(|(k, v)| (k.to_string(), decode(v))).collect()
}

/// A per-uid vector.
pub fn vector_column(value: &Value) -> Vec<u64> {
    value
        .as_array()
        .map(|items| items.iter().map(decode_u64).collect())
        .unwrap_or_default()
}

/// `[[account, amount], ...]` pairs as stored in `StakeFrom`/`StakeTo`.
pub fn stake_pairs(value: &Value) -> Vec<(String, u64)> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                Some([account, amount]) => Some((decode_text(account), decode_u64(amount))),
                _ => None,
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(account, amount)| (account.clone(), decode_u64(amount)))
            .collect(),
        _ => Vec::new(),
    }
}

impl ModuleColumns {
    /// One record per uid present in `keys`, in uid order.
    pub fn into_records(self) -> Vec<ModuleRecord> {
        let at = |column: &[u64], uid: u16| column.get(uid as usize).copied().unwrap_or(0);
        self.keys
            .iter()
            .map(|(&uid, key)| {
                let stake_from = self.stake_from.get(key).cloned().unwrap_or_default();
                ModuleRecord {
                    uid,
                    key: key.clone(),
                    name: self.names.get(&uid).cloned().unwrap_or_default(),
                    address: self.addresses.get(&uid).cloned().unwrap_or_default(),
                    stake: stake_from.iter().map(|(_, amount)| amount).sum(),
                    emission: at(&self.emission, uid),
                    incentive: normalize_u16(at(&self.incentive, uid)),
                    dividends: normalize_u16(at(&self.dividends, uid)),
                    delegation_fee: self
                        .delegation_fee
                        .get(key)
                        .copied()
                        .unwrap_or(DEFAULT_DELEGATION_FEE),
                    last_update: at(&self.last_update, uid),
                    registration_block: self.registration_block.get(&uid).copied().unwrap_or(0),
                    stake_from,
                }
            })
            .collect()
    }
}

/// Records sorted descending by `by` (ascending for `Uid`), truncated to `n`.
pub fn top_modules(mut records: Vec<ModuleRecord>, by: ModuleSort, n: usize) -> Vec<ModuleRecord> {
    let score = |m: &ModuleRecord| -> f64 {
        match by {
            ModuleSort::Stake => m.stake as f64,
            ModuleSort::Emission => m.emission as f64,
            ModuleSort::Incentive => m.incentive,
            ModuleSort::Dividends => m.dividends,
            ModuleSort::Uid => -(m.uid as f64),
        }
    };
    records.sort_by(|a, b| score(b).total_cmp(&score(a)).then(a.uid.cmp(&b.uid)));
    records.truncate(n);
    records
}

/// Records whose name contains `needle`.
pub fn search_modules<'a>(records: &'a [ModuleRecord], needle: &str) -> Vec<&'a ModuleRecord> {
    records.iter().filter(|m| m.name.contains(needle)).collect()
}

pub fn name_to_key(records: &[ModuleRecord]) -> BTreeMap<String, String> {
    records
        .iter()
        .map(|m| (m.name.clone(), m.key.clone()))
        .collect()
}

pub fn key_to_uid(records: &[ModuleRecord]) -> BTreeMap<String, u16> {
    records.iter().map(|m| (m.key.clone(), m.uid)).collect()
}

pub(crate) fn map_key_u16(key: &MapKey) -> Option<u16> {
    key.as_int().and_then(|k| u16::try_from(k).ok())
}
