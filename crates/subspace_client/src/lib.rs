//! Caching chain-state query client and transaction composer for a
//! Subspace-style chain.
//!
//! Reads go through [`QueryEngine`], which caches every storage value and
//! map on disk under a path derived from the query. [`ChainState`] builds
//! typed views (balances, stake, parameters, modules) on top, fanning out
//! through [`FetchCoordinator`]. [`ArchiveStore`] keeps point-in-time
//! snapshots, and [`TransactionComposer`] signs and submits calls while
//! keeping a durable pending/complete record of each one.

pub mod amount;
pub mod archive;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod features;
pub mod fetch;
pub mod logging;
pub mod mock;
pub mod modules;
pub mod query;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod signer;
pub mod state;
pub mod tx;

pub use amount::{from_base_units, to_base_units, AmountFormat, DisplayAmount};
pub use archive::{ArchiveEntry, ArchiveSnapshot, ArchiveStore, SearchRow};
pub use cache::DiskCache;
pub use client::{ModuleUpdate, SubspaceClient};
pub use config::{ClientConfig, ConnectionMode};
pub use connection::{ChainConnection, ConnectionManager, Connector};
pub use error::{ClientError, Result};
pub use features::FeatureRegistry;
pub use fetch::{FetchCoordinator, FetchOutcome};
pub use modules::{ModuleRecord, ModuleSort};
pub use query::{MapKey, Partition, QueryEngine, QueryMapResult, StorageQuery};
pub use signer::{Keypair, Signer};
pub use state::{ChainState, GlobalParams, ReadOpts, SubnetParams};
pub use tx::{Call, CallArg, HistoryKind, TransactionComposer, TxOptions, TxRecord, TxResult, TxStatus};
