//! Typed readers over the query engine: balances, stake, subnet and global
//! parameters, and module records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::DiskCache;
use crate::error::Result;
use crate::fetch::{job, FetchCoordinator, FetchOutcome, Job};
use crate::modules::{
    key_column, map_key_u16, stake_pairs, uid_column, vector_column, ModuleColumns, ModuleRecord,
};
use crate::query::{decode_text, decode_u64, Partition, QueryEngine, QueryMapResult, StorageQuery};
use crate::registry::{StorageItem, GLOBAL_PARAMS, SUBNET_PARAMS};
use crate::signer::is_valid_address;

/// `outer account -> inner account -> amount`.
pub type StakeMap = BTreeMap<String, BTreeMap<String, u64>>;

/// Network, block pin and cache policy of a read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadOpts {
    pub network: Option<String>,
    pub block: Option<u64>,
    pub use_cache: bool,
}

impl ReadOpts {
    pub fn cached() -> Self {
        Self {
            use_cache: true,
            ..Self::default()
        }
    }

    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn on(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn at_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }

    fn cacheable(&self) -> bool {
        self.use_cache && self.block.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetParams {
    pub name: String,
    pub tempo: u64,
    pub immunity_period: u64,
    pub min_allowed_weights: u64,
    pub max_allowed_weights: u64,
    pub max_allowed_uids: u64,
    pub min_stake: u64,
    pub max_stake: u64,
    pub founder: String,
    pub founder_share: u64,
    pub incentive_ratio: u64,
    pub trust_ratio: u64,
    pub vote_threshold: u64,
    pub vote_mode: String,
    pub max_weight_age: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalParams {
    pub burn_rate: u64,
    pub max_name_length: u64,
    pub max_allowed_modules: u64,
    pub max_allowed_subnets: u64,
    pub max_proposals: u64,
    pub max_registrations_per_block: u64,
    pub min_burn: u64,
    pub min_stake: u64,
    pub min_weight_stake: u64,
    pub unit_emission: u64,
    pub tx_rate_limit: u64,
    pub vote_threshold: u64,
    pub vote_mode: String,
}

const TEXT_PARAMS: &[&str] = &["name", "founder", "vote_mode"];

fn param_value(field: &str, raw: &Value) -> Value {
    if TEXT_PARAMS.contains(&field) {
        Value::String(decode_text(raw))
    } else {
        json!(decode_u64(raw))
    }
}

fn free_balance(account: &Value) -> u64 {
    decode_u64(&account["data"]["free"])
}

fn stake_map<'a>(entries: impl Iterator<Item = (String, &'a Value)>) -> StakeMap {
    entries
        .map(|(outer, value)| (outer, stake_pairs(value).into_iter().collect()))
        .collect()
}

enum Column {
    Map(QueryMapResult),
    Vector(Value),
}

impl Column {
    fn map(&self) -> Option<&QueryMapResult> {
        match self {
            Column::Map(m) => Some(m),
            Column::Vector(_) => None,
        }
    }

    fn vector(&self) -> Vec<u64> {
        match self {
            Column::Vector(v) => vector_column(v),
            Column::Map(_) => Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ChainState {
    engine: Arc<QueryEngine>,
    fetch: Arc<FetchCoordinator>,
    cache: Arc<DiskCache>,
}

impl ChainState {
    pub fn new(engine: Arc<QueryEngine>, fetch: Arc<FetchCoordinator>, cache: Arc<DiskCache>) -> Self {
        Self {
            engine,
            fetch,
            cache,
        }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn fetcher(&self) -> &FetchCoordinator {
        &self.fetch
    }

    pub fn network(&self, opts: &ReadOpts) -> String {
        self.engine.resolve_network(opts.network.as_deref())
    }

    fn item(&self, item: StorageItem, opts: &ReadOpts) -> StorageQuery {
        StorageQuery::item(item)
            .on(self.network(opts))
            .at_block(opts.block)
    }

    fn read(&self, q: StorageQuery, opts: &ReadOpts) -> Result<Value> {
        self.engine.query(&q, opts.use_cache)
    }

    fn read_map(&self, q: StorageQuery, opts: &ReadOpts) -> Result<QueryMapResult> {
        self.engine.query_map(&q, opts.use_cache)
    }

    fn map_job(&self, q: StorageQuery, use_cache: bool) -> Job<Column> {
        let engine = Arc::clone(&self.engine);
        job(move || engine.query_map(&q, use_cache).map(Column::Map))
    }

    fn value_job(&self, q: StorageQuery, use_cache: bool) -> Job<Column> {
        let engine = Arc::clone(&self.engine);
        job(move || engine.query(&q, use_cache).map(Column::Vector))
    }

    pub fn block_number(&self, opts: &ReadOpts) -> Result<u64> {
        match opts.block {
            Some(n) => Ok(n),
            None => self.engine.block_number(&self.network(opts)),
        }
    }

    /// Free balance of `address` in base units.
    pub fn balance(&self, address: &str, opts: &ReadOpts) -> Result<u64> {
        let value = self.read(self.item(StorageItem::Account, opts).param(address), opts)?;
        Ok(free_balance(&value))
    }

    /// Free balance of every account, in base units.
    pub fn balances(&self, opts: &ReadOpts) -> Result<BTreeMap<String, u64>> {
        let map = self.read_map(self.item(StorageItem::Account, opts), opts)?;
        Ok(map
            .values()
            .map(|(k, v)| (k.to_string(), free_balance(v)))
            .collect())
    }

    pub fn total_balance(&self, opts: &ReadOpts) -> Result<u64> {
        Ok(self.balances(opts)?.values().sum())
    }

    /// `module -> staker -> amount` in one subnet.
    pub fn stake_from(&self, netuid: u16, opts: &ReadOpts) -> Result<StakeMap> {
        let map = self.read_map(self.item(StorageItem::StakeFrom, opts).partition(netuid), opts)?;
        Ok(stake_map(map.values().map(|(k, v)| (k.to_string(), v))))
    }

    /// `staker -> module -> amount` in one subnet.
    pub fn stake_to(&self, netuid: u16, opts: &ReadOpts) -> Result<StakeMap> {
        let map = self.read_map(self.item(StorageItem::StakeTo, opts).partition(netuid), opts)?;
        Ok(stake_map(map.values().map(|(k, v)| (k.to_string(), v))))
    }

    pub fn stake_from_all(&self, opts: &ReadOpts) -> Result<BTreeMap<u16, StakeMap>> {
        self.stake_all(StorageItem::StakeFrom, opts)
    }

    pub fn stake_to_all(&self, opts: &ReadOpts) -> Result<BTreeMap<u16, StakeMap>> {
        self.stake_all(StorageItem::StakeTo, opts)
    }

    fn stake_all(&self, item: StorageItem, opts: &ReadOpts) -> Result<BTreeMap<u16, StakeMap>> {
        let map = self.read_map(self.item(item, opts).partition(Partition::All), opts)?;
        Ok(map
            .maps()
            .filter_map(|(k, inner)| {
                map_key_u16(k).map(|id| {
                    (id, stake_map(inner.iter().map(|(ik, v)| (ik.to_string(), v))))
                })
            })
            .collect())
    }

    /// Modules `key` stakes to in `netuid`.
    pub fn get_stake_to(&self, key: &str, netuid: u16, opts: &ReadOpts) -> Result<BTreeMap<String, u64>> {
        let value = self.read(
            self.item(StorageItem::StakeTo, opts).partition(netuid).param(key),
            opts,
        )?;
        Ok(stake_pairs(&value).into_iter().collect())
    }

    /// Stakers of `module_key` in `netuid`.
    pub fn get_stake_from(
        &self,
        module_key: &str,
        netuid: u16,
        opts: &ReadOpts,
    ) -> Result<BTreeMap<String, u64>> {
        let value = self.read(
            self.item(StorageItem::StakeFrom, opts)
                .partition(netuid)
                .param(module_key),
            opts,
        )?;
        Ok(stake_pairs(&value).into_iter().collect())
    }

    /// Sum of all stake across subnets.
    pub fn total_stake(&self, opts: &ReadOpts) -> Result<u64> {
        Ok(self
            .stake_to_all(opts)?
            .values()
            .flat_map(|stakers| stakers.values())
            .flat_map(|modules| modules.values())
            .sum())
    }

    /// Total stake plus total free balance.
    pub fn market_cap(&self, opts: &ReadOpts) -> Result<u64> {
        Ok(self.total_stake(opts)? + self.total_balance(opts)?)
    }

    pub fn min_burn(&self, opts: &ReadOpts) -> Result<u64> {
        Ok(decode_u64(&self.read(self.item(StorageItem::MinBurn, opts), opts)?))
    }

    pub fn min_stake(&self, netuid: u16, opts: &ReadOpts) -> Result<u64> {
        Ok(decode_u64(
            &self.read(self.item(StorageItem::MinStake, opts).partition(netuid), opts)?,
        ))
    }

    /// Minimum stake a registration in `netuid` must bring: burn plus the
    /// subnet's minimum stake.
    pub fn min_register_stake(&self, netuid: u16, opts: &ReadOpts) -> Result<u64> {
        Ok(self.min_burn(opts)? + self.min_stake(netuid, opts)?)
    }

    pub fn subnet_names(&self, opts: &ReadOpts) -> Result<BTreeMap<u16, String>> {
        self.engine
            .subnet_names(&self.network(opts), opts.block, opts.use_cache)
    }

    pub fn netuids(&self, opts: &ReadOpts) -> Result<Vec<u16>> {
        Ok(self.subnet_names(opts)?.into_keys().collect())
    }

    /// Concrete netuid for a partition; global and all map to subnet 0.
    pub fn resolve_netuid(&self, partition: &Partition, opts: &ReadOpts) -> Result<u16> {
        Ok(self
            .engine
            .resolve_partition(&self.network(opts), partition)?
            .unwrap_or(0))
    }

    /// Parameters of every subnet matching `partition`.
    pub fn subnet_params(
        &self,
        partition: &Partition,
        opts: &ReadOpts,
    ) -> Result<BTreeMap<u16, SubnetParams>> {
        let network = self.network(opts);
        let key = format!("subnets/{network}.params");
        let all = match opts
            .cacheable()
            .then(|| self.cache.lookup::<BTreeMap<u16, SubnetParams>>(&key))
            .flatten()
        {
            Some(cached) => cached,
            None => {
                let jobs = SUBNET_PARAMS
                    .iter()
                    .map(|(field, item)| (*field, self.map_job(self.item(*item, opts), opts.use_cache)))
                    .collect();
                let columns = self
                    .fetch
                    .fetch_many(jobs, self.fetch.default_timeout())
                    .into_complete()?;
                let mut rows: BTreeMap<u16, Map<String, Value>> = BTreeMap::new();
                for (field, column) in &columns {
                    let Some(map) = column.map() else { continue };
                    for (k, v) in map.values() {
                        if let Some(id) = map_key_u16(k) {
                            rows.entry(id)
                                .or_default()
                                .insert(field.to_string(), param_value(field, v));
                        }
                    }
                }
                let mut params = BTreeMap::new();
                for (id, row) in rows {
                    params.insert(id, serde_json::from_value(Value::Object(row))?);
                }
                if opts.block.is_none() {
                    self.cache.put(&key, &params)?;
                }
                params
            }
        };
        match partition {
            Partition::Global | Partition::All => Ok(all),
            other => {
                let id = self.resolve_netuid(other, opts)?;
                Ok(all.into_iter().filter(|(k, _)| *k == id).collect())
            }
        }
    }

    pub fn global_params(&self, opts: &ReadOpts) -> Result<GlobalParams> {
        let network = self.network(opts);
        let key = format!("global/{network}.params");
        if opts.cacheable() {
            if let Some(cached) = self.cache.lookup::<GlobalParams>(&key) {
                return Ok(cached);
            }
        }
        let jobs = GLOBAL_PARAMS
            .iter()
            .map(|(field, item)| (*field, self.value_job(self.item(*item, opts), opts.use_cache)))
            .collect();
        let columns = self
            .fetch
            .fetch_many(jobs, self.fetch.default_timeout())
            .into_complete()?;
        let mut row = Map::new();
        for (field, column) in columns {
            if let Column::Vector(v) = column {
                row.insert(field.to_string(), param_value(field, &v));
            }
        }
        let params: GlobalParams = serde_json::from_value(Value::Object(row))?;
        if opts.block.is_none() {
            self.cache.put(&key, &params)?;
        }
        Ok(params)
    }

    /// Module records of one subnet, cached per `(network, netuid)`.
    pub fn modules(&self, netuid: u16, opts: &ReadOpts) -> Result<Vec<ModuleRecord>> {
        let network = self.network(opts);
        let key = format!("modules/{network}.{netuid}");
        if opts.cacheable() {
            if let Some(cached) = self.cache.lookup::<Vec<ModuleRecord>>(&key) {
                debug!(%network, netuid, "modules served from cache");
                return Ok(cached);
            }
        }
        let use_cache = opts.use_cache;
        let scoped = |item| self.item(item, opts).partition(netuid);
        let jobs: Vec<(&'static str, Job<Column>)> = vec![
            ("keys", self.map_job(scoped(StorageItem::Keys), use_cache)),
            ("name", self.map_job(scoped(StorageItem::Name), use_cache)),
            ("address", self.map_job(scoped(StorageItem::Address), use_cache)),
            (
                "registration_block",
                self.map_job(scoped(StorageItem::RegistrationBlock), use_cache),
            ),
            (
                "delegation_fee",
                self.map_job(scoped(StorageItem::DelegationFee), use_cache),
            ),
            ("stake_from", self.map_job(scoped(StorageItem::StakeFrom), use_cache)),
            ("emission", self.value_job(scoped(StorageItem::Emission), use_cache)),
            ("incentive", self.value_job(scoped(StorageItem::Incentive), use_cache)),
            ("dividends", self.value_job(scoped(StorageItem::Dividends), use_cache)),
            ("last_update", self.value_job(scoped(StorageItem::LastUpdate), use_cache)),
        ];
        let columns = self
            .fetch
            .fetch_many(jobs, self.fetch.default_timeout())
            .into_complete()?;
        let map_of = |name: &str| columns.get(name).and_then(Column::map).cloned().unwrap_or_default();
        let vec_of = |name: &str| columns.get(name).map(Column::vector).unwrap_or_default();

        let records = ModuleColumns {
            keys: uid_column(&map_of("keys"), decode_text),
            names: uid_column(&map_of("name"), decode_text),
            addresses: uid_column(&map_of("address"), decode_text),
            registration_block: uid_column(&map_of("registration_block"), decode_u64),
            emission: vec_of("emission"),
            incentive: vec_of("incentive"),
            dividends: vec_of("dividends"),
            last_update: vec_of("last_update"),
            delegation_fee: key_column(&map_of("delegation_fee"), decode_u64),
            stake_from: key_column(&map_of("stake_from"), stake_pairs),
        }
        .into_records();

        if opts.block.is_none() {
            self.cache.put(&key, &records)?;
        }
        info!(%network, netuid, modules = records.len(), "modules refreshed");
        Ok(records)
    }

    /// Module records of every subnet. A failing subnet is reported in
    /// `outstanding` without affecting the others.
    pub fn all_modules(&self, opts: &ReadOpts) -> Result<FetchOutcome<u16, Vec<ModuleRecord>>> {
        let netuids = self.netuids(opts)?;
        let state = self.clone();
        let opts = opts.clone();
        Ok(self
            .fetch
            .fetch_partitions(&netuids, self.fetch.default_timeout(), move |id| {
                state.modules(id, &opts)
            }))
    }

    /// Drops cached module records of `network`.
    pub fn invalidate_modules(&self, network: &str) -> Result<usize> {
        let prefix = format!("modules/{network}.");
        let mut removed = 0;
        for key in self.cache.list("modules")? {
            if key.starts_with(&prefix) && self.cache.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn uid2key(&self, netuid: u16, opts: &ReadOpts) -> Result<BTreeMap<u16, String>> {
        let keys = self.read_map(self.item(StorageItem::Keys, opts).partition(netuid), opts)?;
        Ok(uid_column(&keys, decode_text))
    }

    pub fn key2uid(&self, netuid: u16, opts: &ReadOpts) -> Result<BTreeMap<String, u16>> {
        Ok(self
            .uid2key(netuid, opts)?
            .into_iter()
            .map(|(uid, key)| (key, uid))
            .collect())
    }

    pub fn name2key(&self, netuid: u16, opts: &ReadOpts) -> Result<BTreeMap<String, String>> {
        let keys = self.uid2key(netuid, opts)?;
        let names = self.read_map(self.item(StorageItem::Name, opts).partition(netuid), opts)?;
        Ok(uid_column(&names, decode_text)
            .into_iter()
            .filter_map(|(uid, name)| keys.get(&uid).map(|key| (name, key.clone())))
            .collect())
    }

    /// Resolution order: a well-formed address is returned as is, then a
    /// module name registered in `netuid`, then the input unchanged.
    pub fn resolve_address(&self, key_or_name: &str, netuid: u16, opts: &ReadOpts) -> Result<String> {
        if is_valid_address(key_or_name) {
            return Ok(key_or_name.to_string());
        }
        if let Some(key) = self.name2key(netuid, opts)?.get(key_or_name) {
            return Ok(key.clone());
        }
        Ok(key_or_name.to_string())
    }

    /// Refreshes subnet names, subnet parameters and global parameters.
    pub fn light_sync(&self, network: Option<&str>) -> Result<()> {
        let mut opts = ReadOpts::fresh();
        opts.network = network.map(str::to_string);
        let names = self.subnet_names(&opts)?;
        let subnets = self.subnet_params(&Partition::All, &opts)?;
        self.global_params(&opts)?;
        info!(
            network = %self.network(&opts),
            subnets = subnets.len(),
            names = names.len(),
            "light sync complete"
        );
        Ok(())
    }
}
