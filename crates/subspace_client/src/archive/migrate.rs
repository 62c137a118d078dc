//! Snapshot format migrations.
//!
//! Versions seen on disk:
//! - v1: `balances`, `subnets` and `stake_to` rows of `[staker, [[module, amount], ...]]`
//!   per subnet, denominated in the pre-redenomination supply.
//! - v2: `balances`, `modules` as `[key, name, address]` rows, `subnets` as
//!   positional parameter rows and `stake_to`.
//! - v3: column tables `Keys`, `Name`, `Address`, `StakeTo` per subnet next
//!   to `balances` and `subnets` objects.
//! - v4: [`super::ArchiveSnapshot`].

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::SNAPSHOT_VERSION;
use crate::error::{ClientError, Result};
use crate::query::{decode_text, decode_u64};

/// Numerator and denominator of the v1 to v2 supply rescale.
const REDENOMINATION: (u64, u64) = (1_000, 42);

/// Subnet parameters kept as positional rows in v2.
const V2_SUBNET_PARAMS: &[&str] = &[
    "name",
    "tempo",
    "immunity_period",
    "min_allowed_weights",
    "max_allowed_weights",
    "max_allowed_uids",
    "trust_ratio",
    "min_stake",
    "founder",
];

const V3_MODULE_COLUMNS: &[&str] = &["Keys", "Name", "Address"];

/// Transforms a snapshot document from version `from` to `to`.
pub fn migrate_snapshot(value: Value, from: u32, to: u32) -> Result<Value> {
    match (from, to) {
        (1, 2) => v1_to_v2(value),
        (3, 2) => v3_to_v2(value),
        (3, 4) => v3_to_v4(value),
        _ => Err(ClientError::UnsupportedMigration { from, to }),
    }
}

fn rescale(amount: &Value) -> Value {
    let (num, den) = REDENOMINATION;
    let scaled = decode_u64(amount) as u128 * num as u128 / den as u128;
    json!(u64::try_from(scaled).unwrap_or(u64::MAX))
}

fn object<'a>(value: &'a Value, field: &str) -> Result<&'a Map<String, Value>> {
    value[field]
        .as_object()
        .ok_or_else(|| ClientError::invalid(field, "expected an object"))
}

fn array<'a>(value: &'a Value, field: &str) -> Result<&'a Vec<Value>> {
    value[field]
        .as_array()
        .ok_or_else(|| ClientError::invalid(field, "expected an array"))
}

fn v1_to_v2(mut value: Value) -> Result<Value> {
    let balances: Map<String, Value> = object(&value, "balances")?
        .iter()
        .map(|(k, v)| (k.clone(), rescale(v)))
        .collect();
    value["balances"] = Value::Object(balances);

    if let Some(subnets) = value["stake_to"].as_array_mut() {
        for rows in subnets.iter_mut().filter_map(Value::as_array_mut) {
            for row in rows.iter_mut() {
                let Some(pairs) = row.get_mut(1).and_then(Value::as_array_mut) else {
                    continue;
                };
                for pair in pairs.iter_mut() {
                    if let Some(amount) = pair.get_mut(1) {
                        *amount = rescale(amount);
                    }
                }
            }
        }
    }
    value["version"] = json!(2);
    Ok(value)
}

fn column<'a>(value: &'a Value, name: &str, netuid: usize) -> &'a [Value] {
    value[name][netuid].as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn v3_to_v2(value: Value) -> Result<Value> {
    let subnets = array(&value, "subnets")?;
    let mut modules = Vec::new();
    let mut subnet_rows = Vec::new();
    for (netuid, subnet) in subnets.iter().enumerate() {
        let keys = column(&value, "Keys", netuid);
        for i in 0..keys.len() {
            let row: Vec<Value> = V3_MODULE_COLUMNS
                .iter()
                .map(|col| column(&value, col, netuid).get(i).cloned().unwrap_or(Value::Null))
                .collect();
            modules.push(Value::Array(row));
        }
        subnet_rows.push(Value::Array(
            V2_SUBNET_PARAMS
                .iter()
                .map(|p| subnet[*p].clone())
                .collect(),
        ));
    }
    Ok(json!({
        "balances": value["balances"].clone(),
        "modules": modules,
        "version": 2,
        "subnets": subnet_rows,
        "stake_to": value["StakeTo"].clone(),
    }))
}

/// `module -> [(staker, amount)]` from a v3 `StakeTo` table of one subnet.
fn invert_stake_to(table: &Value) -> BTreeMap<String, Vec<(String, u64)>> {
    let mut stake_from: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
    let Some(stakers) = table.as_object() else {
        return stake_from;
    };
    for (staker, pairs) in stakers {
        for pair in pairs.as_array().into_iter().flatten() {
            if let Some([module, amount]) = pair.as_array().map(Vec::as_slice) {
                stake_from
                    .entry(decode_text(module))
                    .or_default()
                    .push((staker.clone(), decode_u64(amount)));
            }
        }
    }
    stake_from
}

fn v3_to_v4(value: Value) -> Result<Value> {
    let subnets = array(&value, "subnets")?;
    let mut modules = Map::new();
    let mut subnet_params = Map::new();
    for (netuid, subnet) in subnets.iter().enumerate() {
        let stake_from = invert_stake_to(&value["StakeTo"][netuid]);
        let keys = column(&value, "Keys", netuid);
        let names = column(&value, "Name", netuid);
        let addresses = column(&value, "Address", netuid);
        let records: Vec<Value> = keys
            .iter()
            .enumerate()
            .map(|(uid, key)| {
                let key = decode_text(key);
                let stakers = stake_from.get(&key).cloned().unwrap_or_default();
                let stake: u64 = stakers.iter().map(|(_, amount)| amount).sum();
                json!({
                    "uid": uid,
                    "key": key,
                    "name": names.get(uid).map(decode_text).unwrap_or_default(),
                    "address": addresses.get(uid).map(decode_text).unwrap_or_default(),
                    "stake": stake,
                    "emission": 0,
                    "incentive": 0.0,
                    "dividends": 0.0,
                    "delegation_fee": crate::modules::DEFAULT_DELEGATION_FEE,
                    "last_update": 0,
                    "registration_block": 0,
                    "stake_from": stakers,
                })
            })
            .collect();
        modules.insert(netuid.to_string(), Value::Array(records));
        subnet_params.insert(netuid.to_string(), subnet.clone());
    }
    Ok(json!({
        "version": SNAPSHOT_VERSION,
        "network": value["network"].as_str().unwrap_or_default(),
        "block": decode_u64(&value["block"]),
        "block_hash": value["block_hash"].as_str().unwrap_or_default(),
        "timestamp": decode_u64(&value["timestamp"]),
        "balances": value["balances"].clone(),
        "modules": modules,
        "subnets": subnet_params,
        "global": value.get("global").cloned().unwrap_or_else(|| json!({})),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveSnapshot;

    fn v3() -> Value {
        json!({
            "balances": {"a": 10, "b": 5},
            "subnets": [
                {"name": "root", "tempo": 100, "immunity_period": 10, "min_allowed_weights": 1,
                 "max_allowed_weights": 420, "max_allowed_uids": 4096, "trust_ratio": 0,
                 "min_stake": 0, "founder": "a"}
            ],
            "Keys": [["k0", "k1"]],
            "Name": [["alpha", "beta"]],
            "Address": [["1.1.1.1:1", "2.2.2.2:2"]],
            "StakeTo": [{"a": [["k0", 7], ["k1", 3]], "b": [["k0", 1]]}],
        })
    }

    #[test]
    fn v1_rescales_balances_and_stake() {
        let v1 = json!({
            "version": 1,
            "balances": {"a": 42, "b": 84},
            "subnets": [{}],
            "stake_to": [[["a", [["m", 420]]]]],
        });
        let v2 = migrate_snapshot(v1, 1, 2).unwrap();
        assert_eq!(v2["version"], 2);
        assert_eq!(v2["balances"]["a"], 1_000);
        assert_eq!(v2["balances"]["b"], 2_000);
        assert_eq!(v2["stake_to"][0][0][1][0][1], 10_000);
    }

    #[test]
    fn v3_flattens_to_rows() {
        let v2 = migrate_snapshot(v3(), 3, 2).unwrap();
        assert_eq!(v2["version"], 2);
        assert_eq!(v2["modules"], json!([["k0", "alpha", "1.1.1.1:1"], ["k1", "beta", "2.2.2.2:2"]]));
        assert_eq!(v2["subnets"][0][0], "root");
        assert_eq!(v2["subnets"][0][1], 100);
        assert_eq!(v2["stake_to"], v3()["StakeTo"]);
    }

    #[test]
    fn v3_upgrades_to_current_schema() {
        let v4 = migrate_snapshot(v3(), 3, 4).unwrap();
        let snapshot: ArchiveSnapshot = serde_json::from_value(v4).unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        let modules = &snapshot.modules[&0];
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "alpha");
        assert_eq!(modules[0].stake, 8);
        assert_eq!(modules[1].stake, 3);
        assert_eq!(snapshot.subnets[&0].tempo, 100);
        assert_eq!(snapshot.total_balance(), 15);
    }

    #[test]
    fn unsupported_pairs_are_rejected() {
        for (from, to) in [(2, 3), (4, 1), (1, 1), (2, 1)] {
            assert!(matches!(
                migrate_snapshot(json!({}), from, to),
                Err(ClientError::UnsupportedMigration { .. })
            ));
        }
    }

    #[test]
    fn malformed_input_is_invalid() {
        let err = migrate_snapshot(json!({"balances": []}), 1, 2).unwrap_err();
        assert!(err.is_validation());
    }
}
