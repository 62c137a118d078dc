//! Named state features resolved to typed handlers.
//!
//! The archive and other bulk readers ask for features by name
//! (`"balances"`, `"modules"`, ...). The registry is built once and each
//! entry carries a handler closure; an unknown name is a caller error.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::query::Partition;
use crate::state::{ChainState, ReadOpts};

pub type FeatureHandler = Arc<dyn Fn(&ChainState, &ReadOpts) -> Result<Value> + Send + Sync>;

pub const BALANCES: &str = "balances";
pub const SUBNET_PARAMS: &str = "subnet_params";
pub const GLOBAL_PARAMS: &str = "global_params";
pub const MODULES: &str = "modules";

/// Features captured by a full archive snapshot.
pub const SNAPSHOT_FEATURES: &[&str] = &[BALANCES, SUBNET_PARAMS, GLOBAL_PARAMS, MODULES];

fn handler<T, F>(f: F) -> FeatureHandler
where
    T: Serialize,
    F: Fn(&ChainState, &ReadOpts) -> Result<T> + Send + Sync + 'static,
{
    Arc::new(move |state: &ChainState, opts: &ReadOpts| Ok(serde_json::to_value(f(state, opts)?)?))
}

pub struct FeatureRegistry {
    handlers: BTreeMap<&'static str, FeatureHandler>,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureRegistry {
    pub fn new() -> Self {
        let mut handlers = BTreeMap::new();
        handlers.insert(BALANCES, handler(|s, o| s.balances(o)));
        handlers.insert(
            SUBNET_PARAMS,
            handler(|s, o| s.subnet_params(&Partition::All, o)),
        );
        handlers.insert(GLOBAL_PARAMS, handler(|s, o| s.global_params(o)));
        handlers.insert(
            MODULES,
            handler(|s, o| {
                let outcome = s.all_modules(o)?;
                outcome.into_complete()
            }),
        );
        Self { handlers }
    }

    /// Registry shared by every client in the process.
    pub fn shared() -> Arc<FeatureRegistry> {
        static SHARED: Lazy<Arc<FeatureRegistry>> = Lazy::new(|| Arc::new(FeatureRegistry::new()));
        Arc::clone(&SHARED)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler(&self, name: &str) -> Result<FeatureHandler> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::invalid("feature", format!("unknown feature {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_features_are_registered() {
        let registry = FeatureRegistry::new();
        for name in SNAPSHOT_FEATURES {
            assert!(registry.contains(name), "{name} missing");
        }
        assert_eq!(registry.names().count(), SNAPSHOT_FEATURES.len());
    }

    #[test]
    fn unknown_feature_is_a_caller_error() {
        let err = FeatureRegistry::shared().handler("weather").err().unwrap();
        assert!(err.is_validation());
    }
}
