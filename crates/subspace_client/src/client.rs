//! Entry point tying configuration, cache, connections, readers, archive and
//! transaction composer together.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::amount::{from_base_units, U16_MAX};
use crate::archive::ArchiveStore;
use crate::cache::DiskCache;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::error::{ClientError, Result};
use crate::features::FeatureRegistry;
use crate::fetch::FetchCoordinator;
use crate::query::{Partition, QueryEngine};
use crate::registry::{self, SUBSPACE_MODULE, SYSTEM_MODULE};
use crate::rpc::HttpConnector;
use crate::signer::Signer;
use crate::state::{ChainState, ReadOpts};
use crate::tx::{Call, CallArg, TransactionComposer, TxOptions, TxResult};

const BALANCES_MODULE: &str = "Balances";
const MAX_DELEGATION_FEE: u64 = 100;

/// Optional fields of a module update; unset fields keep their current
/// on-chain values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub delegation_fee: Option<u64>,
}

pub struct SubspaceClient {
    config: ClientConfig,
    cache: Arc<DiskCache>,
    connections: Arc<ConnectionManager>,
    state: ChainState,
    archive: ArchiveStore,
    composer: TransactionComposer,
}

impl SubspaceClient {
    /// Client speaking JSON-RPC over HTTP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = Arc::new(HttpConnector::new(config.connection.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        registry::validate().map_err(ClientError::Config)?;
        let cache = Arc::new(DiskCache::open(&config.cache_dir)?);
        let connections = Arc::new(ConnectionManager::new(&config, connector));
        let engine = Arc::new(QueryEngine::new(
            &config,
            Arc::clone(&connections),
            Arc::clone(&cache),
        ));
        let fetch = Arc::new(FetchCoordinator::new(&config.fetch)?);
        let state = ChainState::new(engine, fetch, Arc::clone(&cache));
        let archive = ArchiveStore::new(config.archive_dir(), state.clone(), FeatureRegistry::shared())?;
        let composer = TransactionComposer::new(Arc::clone(&connections), Arc::clone(&cache));
        info!(
            network = %config.network,
            cache_dir = %config.cache_dir.display(),
            "subspace client ready"
        );
        Ok(Self {
            config,
            cache,
            connections,
            state,
            archive,
            composer,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn engine(&self) -> &QueryEngine {
        self.state.engine()
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn composer(&self) -> &TransactionComposer {
        &self.composer
    }

    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.config.archive.retention_hours * 3600)
    }

    fn read_opts(options: &TxOptions) -> ReadOpts {
        ReadOpts {
            network: options.network.clone(),
            block: None,
            use_cache: true,
        }
    }

    fn resolve(&self, key_or_name: &str, netuid: u16, options: &TxOptions) -> Result<String> {
        self.state
            .resolve_address(key_or_name, netuid, &Self::read_opts(options))
    }

    pub fn transfer(&self, dest: &str, amount: f64, signer: &dyn Signer, options: &TxOptions) -> Result<TxResult> {
        let dest = self.resolve(dest, 0, options)?;
        let call = Call::new(BALANCES_MODULE, "transfer")
            .address("dest", dest)
            .amount("value", amount);
        self.composer.compose_call(call, signer, options)
    }

    pub fn add_stake(
        &self,
        module: &str,
        amount: f64,
        netuid: u16,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let module_key = self.resolve(module, netuid, options)?;
        let call = Call::new(SUBSPACE_MODULE, "add_stake")
            .arg("netuid", u64::from(netuid))
            .address("module_key", module_key)
            .amount("amount", amount);
        self.composer.compose_call(call, signer, options)
    }

    pub fn remove_stake(
        &self,
        module: &str,
        amount: f64,
        netuid: u16,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let module_key = self.resolve(module, netuid, options)?;
        let call = Call::new(SUBSPACE_MODULE, "remove_stake")
            .arg("netuid", u64::from(netuid))
            .address("module_key", module_key)
            .amount("amount", amount);
        self.composer.compose_call(call, signer, options)
    }

    pub fn transfer_stake(
        &self,
        from_module: &str,
        to_module: &str,
        amount: f64,
        netuid: u16,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let module_key = self.resolve(from_module, netuid, options)?;
        let new_module_key = self.resolve(to_module, netuid, options)?;
        let call = Call::new(SUBSPACE_MODULE, "transfer_stake")
            .arg("netuid", u64::from(netuid))
            .address("module_key", module_key)
            .address("new_module_key", new_module_key)
            .amount("amount", amount);
        self.composer.compose_call(call, signer, options)
    }

    /// Registers a module in `subnet`. Without an explicit `stake` the
    /// minimum registration stake plus one token is used. A subnet name that
    /// does not exist yet is created by the registration and priced like
    /// subnet 0.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        name: &str,
        address: &str,
        subnet: &str,
        stake: Option<f64>,
        module_key: Option<&str>,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let opts = Self::read_opts(options);
        let stake = match stake {
            Some(stake) => stake,
            None => {
                let netuid = match self.state.resolve_netuid(&Partition::parse(subnet), &opts) {
                    Ok(id) => id,
                    Err(ClientError::UnknownPartition(_)) => 0,
                    Err(e) => return Err(e),
                };
                from_base_units(self.state.min_register_stake(netuid, &opts)?) + 1.0
            }
        };
        let module_key = module_key
            .map(str::to_string)
            .unwrap_or_else(|| signer.address());
        let call = Call::new(SUBSPACE_MODULE, "register")
            .arg("network", subnet)
            .arg("name", name)
            .arg("address", address)
            .amount("stake", stake)
            .address("module_key", module_key);
        self.composer.compose_call(call, signer, options)
    }

    /// Updates a registered module, keeping current values for unset fields.
    pub fn update_module(
        &self,
        module: &str,
        update: ModuleUpdate,
        netuid: u16,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        if let Some(fee) = update.delegation_fee {
            if fee > MAX_DELEGATION_FEE {
                return Err(ClientError::invalid(
                    "delegation_fee",
                    format!("{fee} is outside 0..={MAX_DELEGATION_FEE}"),
                ));
            }
        }
        let opts = Self::read_opts(options);
        let key = self.resolve(module, netuid, options)?;
        let current = self
            .state
            .modules(netuid, &opts)?
            .into_iter()
            .find(|m| m.key == key)
            .ok_or_else(|| ClientError::UnknownAddress(key.clone()))?;
        let call = Call::new(SUBSPACE_MODULE, "update_module")
            .arg("netuid", u64::from(netuid))
            .arg("name", update.name.unwrap_or(current.name))
            .arg("address", update.address.unwrap_or(current.address))
            .arg(
                "delegation_fee",
                update.delegation_fee.unwrap_or(current.delegation_fee),
            );
        self.composer.compose_call(call, signer, options)
    }

    /// Sets the signer's weights on `netuid`. Weights are normalised so they
    /// sum to `u16::MAX`; when more uids are given than the subnet allows,
    /// the heaviest ones are kept.
    pub fn set_weights(
        &self,
        uids: &[u16],
        weights: &[f64],
        netuid: u16,
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let mut pairs = weight_pairs(uids, weights)?;
        let params = self
            .state
            .subnet_params(&Partition::Id(netuid), &Self::read_opts(options))?;
        let max = params
            .get(&netuid)
            .map(|p| p.max_allowed_weights)
            .filter(|max| *max > 0)
            .unwrap_or(u64::MAX);
        if pairs.len() as u64 > max {
            pairs.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            pairs.truncate(max as usize);
            pairs.sort_by_key(|(uid, _)| *uid);
        }
        let (uids, weights) = normalize_weights(&pairs);
        let call = Call::new(SUBSPACE_MODULE, "set_weights")
            .arg("netuid", u64::from(netuid))
            .arg("uids", CallArg::List(uids.into_iter().map(CallArg::Int).collect()))
            .arg(
                "weights",
                CallArg::List(weights.into_iter().map(CallArg::Int).collect()),
            );
        self.composer.compose_call(call, signer, options)
    }

    /// Overlays `updates` on the current global parameters and submits them
    /// as a privileged call.
    pub fn update_global(
        &self,
        updates: &[(&str, CallArg)],
        signer: &dyn Signer,
        options: &TxOptions,
    ) -> Result<TxResult> {
        let current = serde_json::to_value(self.state.global_params(&Self::read_opts(options))?)?;
        let Value::Object(fields) = current else {
            return Err(ClientError::Config("global params are not an object".into()));
        };
        let mut call = Call::new(SUBSPACE_MODULE, "update_global");
        for (name, value) in &fields {
            let arg = match value {
                Value::String(s) => CallArg::Text(s.clone()),
                other => CallArg::Int(other.as_u64().unwrap_or(0)),
            };
            call = call.arg(name, arg);
        }
        for (name, arg) in updates {
            if !fields.contains_key(*name) {
                return Err(ClientError::invalid(name, "not a global parameter"));
            }
            call = call.arg(name, arg.clone());
        }
        let options = TxOptions {
            sudo: true,
            ..options.clone()
        };
        self.composer.compose_call(call, signer, &options)
    }

    /// Replaces the runtime code.
    pub fn set_code(&self, wasm: &[u8], signer: &dyn Signer, options: &TxOptions) -> Result<TxResult> {
        if wasm.is_empty() {
            return Err(ClientError::invalid("code", "runtime code is empty"));
        }
        let call = Call::new(SYSTEM_MODULE, "set_code").arg("code", format!("0x{}", hex::encode(wasm)));
        let options = TxOptions {
            sudo: true,
            unchecked_weight: true,
            ..options.clone()
        };
        self.composer.compose_call(call, signer, &options)
    }

    /// Drops pooled connections. The disk cache is left in place.
    pub fn shutdown(&self) {
        self.connections.clear();
        info!(network = %self.config.network, "subspace client shut down");
    }
}

fn weight_pairs(uids: &[u16], weights: &[f64]) -> Result<Vec<(u16, f64)>> {
    if uids.is_empty() {
        return Err(ClientError::invalid("uids", "no weights given"));
    }
    if uids.len() != weights.len() {
        return Err(ClientError::invalid(
            "weights",
            format!("{} uids but {} weights", uids.len(), weights.len()),
        ));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ClientError::invalid("weights", "weights must be finite and non-negative"));
    }
    Ok(uids.iter().copied().zip(weights.iter().copied()).collect())
}

/// Scales weights to integers summing to at most `u16::MAX`.
fn normalize_weights(pairs: &[(u16, f64)]) -> (Vec<u64>, Vec<u64>) {
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    let uids = pairs.iter().map(|(uid, _)| u64::from(*uid)).collect();
    let weights = pairs
        .iter()
        .map(|(_, w)| {
            if total > 0.0 {
                (w / total * U16_MAX as f64) as u64
            } else {
                0
            }
        })
        .collect();
    (uids, weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_normalise_to_u16() {
        let (uids, weights) = normalize_weights(&[(3, 1.0), (1, 3.0)]);
        assert_eq!(uids, vec![3, 1]);
        assert_eq!(weights, vec![16_383, 49_151]);
        assert!(weights.iter().sum::<u64>() <= U16_MAX);
        let (_, zeros) = normalize_weights(&[(0, 0.0)]);
        assert_eq!(zeros, vec![0]);
    }

    #[test]
    fn weight_input_is_checked() {
        assert!(weight_pairs(&[], &[]).is_err());
        assert!(weight_pairs(&[1, 2], &[1.0]).is_err());
        assert!(weight_pairs(&[1], &[f64::NAN]).is_err());
        assert!(weight_pairs(&[1], &[-1.0]).unwrap_err().is_validation());
        assert_eq!(weight_pairs(&[1], &[0.5]).unwrap(), vec![(1, 0.5)]);
    }
}
