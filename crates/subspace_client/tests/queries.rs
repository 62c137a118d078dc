mod support;

use subspace_client::query::MapKey;
use subspace_client::registry::StorageItem;
use subspace_client::{ClientError, Partition, ReadOpts, StorageQuery};
use support::{address, harness, TOKEN};

#[test]
fn cached_stake_read_makes_one_live_call() {
    let h = harness();
    let state = h.client.state();
    let before = h.chain.query_map_calls();
    let live = state.stake_from(0, &ReadOpts::fresh()).unwrap();
    let cached = state.stake_from(0, &ReadOpts::cached()).unwrap();
    assert_eq!(live, cached);
    assert_eq!(h.chain.query_map_calls() - before, 1);
    assert_eq!(live[&address(10)][&address(9)], 100 * TOKEN);
}

#[test]
fn fresh_read_bypasses_and_refreshes_cache() {
    let h = harness();
    let state = h.client.state();
    let first = state.min_burn(&ReadOpts::cached()).unwrap();
    h.chain.set("SubspaceModule", "MinBurn", vec![], serde_json::json!(7));
    assert_eq!(state.min_burn(&ReadOpts::cached()).unwrap(), first);
    assert_eq!(state.min_burn(&ReadOpts::fresh()).unwrap(), 7);
    assert_eq!(state.min_burn(&ReadOpts::cached()).unwrap(), 7);
}

#[test]
fn map_keys_come_back_sorted() {
    let h = harness();
    let names = h.client.state().subnet_names(&ReadOpts::fresh()).unwrap();
    assert_eq!(names.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

    let q = StorageQuery::item(StorageItem::StakeFrom).partition(Partition::All);
    let all = h.client.engine().query_map(&q, false).unwrap();
    assert!(all.is_nested());
    let outer: Vec<&MapKey> = all.keys().collect();
    assert_eq!(outer, vec![&MapKey::Int(0), &MapKey::Int(1)]);
    let inner: Vec<&MapKey> = all.partition(0).unwrap().keys().collect();
    let mut sorted = inner.clone();
    sorted.sort();
    assert_eq!(inner, sorted);
}

#[test]
fn unknown_partition_name_is_rejected() {
    let h = harness();
    let q = StorageQuery::item(StorageItem::StakeFrom).partition(Partition::Named("nope".into()));
    match h.client.engine().query_map(&q, true) {
        Err(ClientError::UnknownPartition(name)) => assert_eq!(name, "nope"),
        other => panic!("expected UnknownPartition, got {other:?}"),
    }
    let named = StorageQuery::item(StorageItem::Tempo).partition(Partition::Named("alpha".into()));
    assert_eq!(h.client.engine().query(&named, true).unwrap(), 50);
}

#[test]
fn min_register_stake_is_burn_plus_min_stake() {
    let h = harness();
    let state = h.client.state();
    let opts = ReadOpts::cached();
    for netuid in [0, 1] {
        assert_eq!(
            state.min_register_stake(netuid, &opts).unwrap(),
            state.min_burn(&opts).unwrap() + state.min_stake(netuid, &opts).unwrap()
        );
    }
    assert_eq!(state.min_register_stake(1, &opts).unwrap(), 3 * TOKEN);
}

#[test]
fn balances_stake_and_market_cap() {
    let h = harness();
    let state = h.client.state();
    let opts = ReadOpts::fresh();
    assert_eq!(state.balance(&address(1), &opts).unwrap(), 1_000 * TOKEN);
    assert_eq!(state.balance(&address(2), &opts).unwrap(), 0);
    assert_eq!(state.balances(&opts).unwrap().len(), 2);
    assert_eq!(state.total_balance(&opts).unwrap(), 1_040 * TOKEN);
    assert_eq!(state.total_stake(&opts).unwrap(), 160 * TOKEN);
    assert_eq!(state.market_cap(&opts).unwrap(), 1_200 * TOKEN);

    let stake_to = state.get_stake_to(&address(9), 0, &opts).unwrap();
    assert_eq!(stake_to[&address(11)], 50 * TOKEN);
    let stake_from = state.get_stake_from(&address(12), 1, &opts).unwrap();
    assert_eq!(stake_from[&address(9)], 10 * TOKEN);
    let all = state.stake_to_all(&opts).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn subnet_and_global_params() {
    let h = harness();
    let state = h.client.state();
    let opts = ReadOpts::cached();
    let all = state.subnet_params(&Partition::All, &opts).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&0].name, "root");
    assert_eq!(all[&0].tempo, 100);
    assert_eq!(all[&0].founder, address(9));
    assert_eq!(all[&1].vote_mode, "authority");
    assert_eq!(all[&1].min_stake, TOKEN);

    let alpha = state
        .subnet_params(&Partition::Named("alpha".into()), &opts)
        .unwrap();
    assert_eq!(alpha.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert!(h.client.cache().exists("subnets/test.params"));

    let global = state.global_params(&opts).unwrap();
    assert_eq!(global.burn_rate, 10);
    assert_eq!(global.min_burn, 2 * TOKEN);
    assert_eq!(global.max_name_length, 32);
    assert_eq!(global.vote_mode, "authority");
}

#[test]
fn modules_are_assembled_and_cached() {
    let h = harness();
    let state = h.client.state();
    let modules = state.modules(0, &ReadOpts::cached()).unwrap();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].name, "alice-mod");
    assert_eq!(modules[0].key, address(10));
    assert_eq!(modules[0].stake, 100 * TOKEN);
    assert_eq!(modules[0].emission, 10);
    assert_eq!(modules[0].incentive, 1.0);
    assert_eq!(modules[0].delegation_fee, 20);
    assert_eq!(modules[1].delegation_fee, 5);
    assert_eq!(modules[1].dividends, 1.0);
    assert_eq!(modules[1].last_update, 8);

    let (reads, maps) = (h.chain.query_calls(), h.chain.query_map_calls());
    assert_eq!(state.modules(0, &ReadOpts::cached()).unwrap(), modules);
    assert_eq!((h.chain.query_calls(), h.chain.query_map_calls()), (reads, maps));

    assert_eq!(state.invalidate_modules("test").unwrap(), 1);
    assert!(!h.client.cache().exists("modules/test.0"));
}

#[test]
fn all_modules_cover_every_subnet() {
    let h = harness();
    let outcome = h.client.state().all_modules(&ReadOpts::fresh()).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.results[&0].len(), 2);
    assert_eq!(outcome.results[&1][0].name, "carol-mod");
}

#[test]
fn address_resolution_order() {
    let h = harness();
    let state = h.client.state();
    let opts = ReadOpts::cached();
    assert_eq!(state.resolve_address("bob-mod", 0, &opts).unwrap(), address(11));
    assert_eq!(state.resolve_address(&address(3), 0, &opts).unwrap(), address(3));
    assert_eq!(state.resolve_address("carol-mod", 0, &opts).unwrap(), "carol-mod");
    assert_eq!(state.key2uid(1, &opts).unwrap()[&address(12)], 0);
    assert_eq!(state.uid2key(0, &opts).unwrap()[&1], address(11));
}

#[test]
fn connections_are_reused_until_shutdown() {
    let h = harness();
    let state = h.client.state();
    state.balances(&ReadOpts::fresh()).unwrap();
    state.min_burn(&ReadOpts::fresh()).unwrap();
    assert_eq!(h.connector.opens(), 1);
    h.client.shutdown();
    assert!(h.client.connections().cached_urls().is_empty());
    state.min_burn(&ReadOpts::fresh()).unwrap();
    assert_eq!(h.connector.opens(), 2);
}

#[test]
fn transient_read_failures_are_retried() {
    let h = harness();
    h.chain.fail_item("StakeTo", 2);
    let stake = h.client.state().stake_to(0, &ReadOpts::fresh()).unwrap();
    assert_eq!(stake[&address(9)].len(), 2);
}

#[test]
fn unreachable_node_is_not_retried_per_map_attempt() {
    let h = harness();
    h.connector.fail_next_opens(usize::MAX);
    let err = h.client.state().stake_to(0, &ReadOpts::fresh()).unwrap_err();
    assert!(matches!(err, ClientError::Connection { .. }));
    assert_eq!(h.connector.opens(), h.client.config().connection.retries as usize);
    assert_eq!(h.chain.query_map_calls(), 0);
}

#[test]
fn light_sync_refreshes_parameter_caches() {
    let h = harness();
    h.client.state().light_sync(None).unwrap();
    assert!(h.client.cache().exists("subnets/test.params"));
    assert!(h.client.cache().exists("global/test.params"));
    assert_eq!(h.client.state().block_number(&ReadOpts::fresh()).unwrap(), 1_000);
}
