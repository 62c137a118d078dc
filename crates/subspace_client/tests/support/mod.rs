#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use subspace_client::config::EndpointSet;
use subspace_client::mock::{MockChain, MockConnector};
use subspace_client::registry::{SUBSPACE_MODULE, SYSTEM_MODULE};
use subspace_client::{ClientConfig, Keypair, Signer, SubspaceClient};
use tempfile::TempDir;

pub const NETWORK: &str = "test";
pub const TOKEN: u64 = 1_000_000_000;

pub struct Harness {
    pub dir: TempDir,
    pub chain: Arc<MockChain>,
    pub connector: Arc<MockConnector>,
    pub client: SubspaceClient,
}

pub fn keypair(seed: u8) -> Keypair {
    Keypair::from_seed(&[seed; 32])
}

pub fn address(seed: u8) -> String {
    keypair(seed).address()
}

pub fn config(dir: &TempDir) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.network = NETWORK.into();
    cfg.cache_dir = dir.path().join("cache");
    cfg.urls.insert(
        NETWORK.into(),
        EndpointSet {
            http: vec!["mock://test".into()],
            ws: vec![],
        },
    );
    cfg.connection.backoff_base_ms = 1;
    cfg.connection.backoff_max_ms = 2;
    cfg.connection.jitter_ms = 0;
    cfg.query.map_backoff_base_ms = 1;
    cfg.query.map_backoff_max_ms = 2;
    cfg.fetch.workers = 4;
    cfg.fetch.timeout_ms = 10_000;
    cfg
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let chain = Arc::new(MockChain::new());
    seed(&chain);
    let connector = Arc::new(MockConnector::new(Arc::clone(&chain)));
    let client = SubspaceClient::with_connector(config(&dir), connector.clone()).expect("client");
    Harness {
        dir,
        chain,
        connector,
        client,
    }
}

fn sub(chain: &MockChain, name: &str, key: Vec<Value>, value: Value) {
    chain.set(SUBSPACE_MODULE, name, key, value);
}

/// Two subnets: `root` (0) with two modules and `alpha` (1) with one, all
/// staked by `address(9)`.
pub fn seed(chain: &MockChain) {
    let staker = address(9);
    let (k0, k1, k2) = (address(10), address(11), address(12));

    sub(chain, "SubnetNames", vec![json!(1)], json!("alpha"));
    sub(chain, "SubnetNames", vec![json!(0)], json!("root"));
    for (netuid, tempo, max_weights, min_stake) in [(0, 100, 2, TOKEN / 2), (1, 50, 10, TOKEN)] {
        sub(chain, "Tempo", vec![json!(netuid)], json!(tempo));
        sub(chain, "MaxAllowedWeights", vec![json!(netuid)], json!(max_weights));
        sub(chain, "MinStake", vec![json!(netuid)], json!(min_stake));
        sub(chain, "Founder", vec![json!(netuid)], json!(staker));
        sub(chain, "VoteModeSubnet", vec![json!(netuid)], json!("authority"));
    }
    sub(chain, "MinBurn", vec![], json!(2 * TOKEN));
    sub(chain, "BurnRate", vec![], json!(10));
    sub(chain, "MaxNameLength", vec![], json!(32));
    sub(chain, "VoteModeGlobal", vec![], json!("authority"));

    let modules = [(0, 0, &k0, "alice-mod"), (0, 1, &k1, "bob-mod"), (1, 0, &k2, "carol-mod")];
    for (netuid, uid, key, name) in modules {
        sub(chain, "Keys", vec![json!(netuid), json!(uid)], json!(key));
        sub(chain, "Name", vec![json!(netuid), json!(uid)], json!(name));
        sub(
            chain,
            "Address",
            vec![json!(netuid), json!(uid)],
            json!(format!("10.0.0.{uid}:8000")),
        );
    }
    sub(chain, "StakeFrom", vec![json!(0), json!(k0)], json!([[staker, 100 * TOKEN]]));
    sub(chain, "StakeFrom", vec![json!(0), json!(k1)], json!([[staker, 50 * TOKEN]]));
    sub(chain, "StakeFrom", vec![json!(1), json!(k2)], json!([[staker, 10 * TOKEN]]));
    sub(
        chain,
        "StakeTo",
        vec![json!(0), json!(staker)],
        json!([[k0, 100 * TOKEN], [k1, 50 * TOKEN]]),
    );
    sub(chain, "StakeTo", vec![json!(1), json!(staker)], json!([[k2, 10 * TOKEN]]));
    sub(chain, "DelegationFee", vec![json!(0), json!(k1)], json!(5));
    sub(chain, "Emission", vec![json!(0)], json!([10, 20]));
    sub(chain, "Incentive", vec![json!(0)], json!([65_535, 0]));
    sub(chain, "Dividends", vec![json!(0)], json!([0, 65_535]));
    sub(chain, "LastUpdate", vec![json!(0)], json!([7, 8]));

    for (seed, free) in [(1u8, 1_000 * TOKEN), (9, 40 * TOKEN)] {
        chain.set(
            SYSTEM_MODULE,
            "Account",
            vec![json!(address(seed))],
            json!({"nonce": 0, "data": {"free": free, "reserved": 0}}),
        );
    }
    chain.set_block(1_000);
}
