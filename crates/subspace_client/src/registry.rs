//! Static mapping from feature names to chain storage items.

use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const SUBSPACE_MODULE: &str = "SubspaceModule";
pub const SYSTEM_MODULE: &str = "System";

/// How an item is laid out on chain, relative to a subnet id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageLayout {
    /// Single value with no key.
    Value,
    /// Map keyed by subnet id or by account.
    Map,
    /// Double map keyed by `(netuid, uid | key)`.
    DoubleMap,
    /// Per-subnet vector indexed by uid.
    Vector,
}

macro_rules! storage_items {
    ($( $variant:ident => ($feature:literal, $module:expr, $layout:ident) ),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum StorageItem {
            $( $variant ),+
        }

        impl StorageItem {
            pub const ALL: &'static [StorageItem] = &[$( StorageItem::$variant ),+];

            /// Storage name as the chain spells it.
            pub fn storage_name(self) -> &'static str {
                match self {
                    $( StorageItem::$variant => stringify!($variant) ),+
                }
            }

            /// Snake-case feature name used by callers and on disk.
            pub fn feature(self) -> &'static str {
                match self {
                    $( StorageItem::$variant => $feature ),+
                }
            }

            pub fn module(self) -> &'static str {
                match self {
                    $( StorageItem::$variant => $module ),+
                }
            }

            pub fn layout(self) -> StorageLayout {
                match self {
                    $( StorageItem::$variant => StorageLayout::$layout ),+
                }
            }
        }
    };
}

storage_items! {
    Account => ("account", SYSTEM_MODULE, Map),
    SubnetNames => ("subnet_names", SUBSPACE_MODULE, Map),
    Keys => ("keys", SUBSPACE_MODULE, DoubleMap),
    Name => ("name", SUBSPACE_MODULE, DoubleMap),
    Address => ("address", SUBSPACE_MODULE, DoubleMap),
    RegistrationBlock => ("registration_block", SUBSPACE_MODULE, DoubleMap),
    StakeFrom => ("stake_from", SUBSPACE_MODULE, DoubleMap),
    StakeTo => ("stake_to", SUBSPACE_MODULE, DoubleMap),
    DelegationFee => ("delegation_fee", SUBSPACE_MODULE, DoubleMap),
    Weights => ("weights", SUBSPACE_MODULE, DoubleMap),
    ProfitShares => ("profit_shares", SUBSPACE_MODULE, Map),
    Emission => ("emission", SUBSPACE_MODULE, Vector),
    Incentive => ("incentive", SUBSPACE_MODULE, Vector),
    Dividends => ("dividends", SUBSPACE_MODULE, Vector),
    LastUpdate => ("last_update", SUBSPACE_MODULE, Vector),
    Trust => ("trust", SUBSPACE_MODULE, Vector),
    Tempo => ("tempo", SUBSPACE_MODULE, Map),
    ImmunityPeriod => ("immunity_period", SUBSPACE_MODULE, Map),
    MinAllowedWeights => ("min_allowed_weights", SUBSPACE_MODULE, Map),
    MaxAllowedWeights => ("max_allowed_weights", SUBSPACE_MODULE, Map),
    MaxAllowedUids => ("max_allowed_uids", SUBSPACE_MODULE, Map),
    MinStake => ("min_stake", SUBSPACE_MODULE, Map),
    MaxStake => ("max_stake", SUBSPACE_MODULE, Map),
    Founder => ("founder", SUBSPACE_MODULE, Map),
    FounderShare => ("founder_share", SUBSPACE_MODULE, Map),
    IncentiveRatio => ("incentive_ratio", SUBSPACE_MODULE, Map),
    TrustRatio => ("trust_ratio", SUBSPACE_MODULE, Map),
    VoteThresholdSubnet => ("vote_threshold_subnet", SUBSPACE_MODULE, Map),
    VoteModeSubnet => ("vote_mode_subnet", SUBSPACE_MODULE, Map),
    MaxWeightAge => ("max_weight_age", SUBSPACE_MODULE, Map),
    BurnRate => ("burn_rate", SUBSPACE_MODULE, Value),
    MaxNameLength => ("max_name_length", SUBSPACE_MODULE, Value),
    MaxAllowedModules => ("max_allowed_modules", SUBSPACE_MODULE, Value),
    MaxAllowedSubnets => ("max_allowed_subnets", SUBSPACE_MODULE, Value),
    MaxProposals => ("max_proposals", SUBSPACE_MODULE, Value),
    MaxRegistrationsPerBlock => ("max_registrations_per_block", SUBSPACE_MODULE, Value),
    MinBurn => ("min_burn", SUBSPACE_MODULE, Value),
    MinStakeGlobal => ("min_stake_global", SUBSPACE_MODULE, Value),
    MinWeightStake => ("min_weight_stake", SUBSPACE_MODULE, Value),
    UnitEmission => ("unit_emission", SUBSPACE_MODULE, Value),
    TxRateLimit => ("tx_rate_limit", SUBSPACE_MODULE, Value),
    GlobalVoteThreshold => ("global_vote_threshold", SUBSPACE_MODULE, Value),
    VoteModeGlobal => ("vote_mode_global", SUBSPACE_MODULE, Value),
}

/// Subnet parameter field name to the map holding it, keyed by netuid.
pub const SUBNET_PARAMS: &[(&str, StorageItem)] = &[
    ("name", StorageItem::SubnetNames),
    ("tempo", StorageItem::Tempo),
    ("immunity_period", StorageItem::ImmunityPeriod),
    ("min_allowed_weights", StorageItem::MinAllowedWeights),
    ("max_allowed_weights", StorageItem::MaxAllowedWeights),
    ("max_allowed_uids", StorageItem::MaxAllowedUids),
    ("min_stake", StorageItem::MinStake),
    ("max_stake", StorageItem::MaxStake),
    ("founder", StorageItem::Founder),
    ("founder_share", StorageItem::FounderShare),
    ("incentive_ratio", StorageItem::IncentiveRatio),
    ("trust_ratio", StorageItem::TrustRatio),
    ("vote_threshold", StorageItem::VoteThresholdSubnet),
    ("vote_mode", StorageItem::VoteModeSubnet),
    ("max_weight_age", StorageItem::MaxWeightAge),
];

/// Global parameter field name to its plain storage value.
pub const GLOBAL_PARAMS: &[(&str, StorageItem)] = &[
    ("burn_rate", StorageItem::BurnRate),
    ("max_name_length", StorageItem::MaxNameLength),
    ("max_allowed_modules", StorageItem::MaxAllowedModules),
    ("max_allowed_subnets", StorageItem::MaxAllowedSubnets),
    ("max_proposals", StorageItem::MaxProposals),
    ("max_registrations_per_block", StorageItem::MaxRegistrationsPerBlock),
    ("min_burn", StorageItem::MinBurn),
    ("min_stake", StorageItem::MinStakeGlobal),
    ("min_weight_stake", StorageItem::MinWeightStake),
    ("unit_emission", StorageItem::UnitEmission),
    ("tx_rate_limit", StorageItem::TxRateLimit),
    ("vote_threshold", StorageItem::GlobalVoteThreshold),
    ("vote_mode", StorageItem::VoteModeGlobal),
];

static BY_FEATURE: Lazy<HashMap<&'static str, StorageItem>> = Lazy::new(|| {
    StorageItem::ALL
        .iter()
        .map(|item| (item.feature(), *item))
        .collect()
});

static BY_STORAGE_NAME: Lazy<HashMap<&'static str, StorageItem>> = Lazy::new(|| {
    StorageItem::ALL
        .iter()
        .map(|item| (item.storage_name(), *item))
        .collect()
});

impl StorageItem {
    pub fn from_feature(feature: &str) -> Option<Self> {
        BY_FEATURE.get(feature).copied()
    }

    pub fn from_storage_name(name: &str) -> Option<Self> {
        BY_STORAGE_NAME.get(name).copied()
    }
}

/// `stake_from` -> `StakeFrom`, for names with no registry entry.
pub fn camel_case(snake: &str) -> String {
    snake
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Resolves a caller-supplied storage name: registry features first, then
/// chain storage names, then a CamelCase conversion in `module`.
pub fn resolve_name(name: &str, module: &str) -> (String, String) {
    if let Some(item) = StorageItem::from_feature(name).or_else(|| StorageItem::from_storage_name(name)) {
        return (item.module().to_string(), item.storage_name().to_string());
    }
    let storage = if name.contains('_') || name.starts_with(|c: char| c.is_ascii_lowercase()) {
        camel_case(name)
    } else {
        name.to_string()
    };
    (module.to_string(), storage)
}

/// Checks that feature and storage names are unique and that every
/// parameter table points at an item of the right layout. Run once at
/// client construction.
pub fn validate() -> Result<(), String> {
    if BY_FEATURE.len() != StorageItem::ALL.len() {
        return Err("duplicate feature name in storage registry".into());
    }
    if BY_STORAGE_NAME.len() != StorageItem::ALL.len() {
        return Err("duplicate storage name in storage registry".into());
    }
    for (field, item) in SUBNET_PARAMS {
        if item.layout() != StorageLayout::Map {
            return Err(format!("subnet param {field} is not keyed by netuid"));
        }
    }
    for (field, item) in GLOBAL_PARAMS {
        if item.layout() != StorageLayout::Value {
            return Err(format!("global param {field} is not a plain value"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_consistent() {
        validate().unwrap();
    }

    #[test]
    fn lookups_agree() {
        for item in StorageItem::ALL {
            assert_eq!(StorageItem::from_feature(item.feature()), Some(*item));
            assert_eq!(StorageItem::from_storage_name(item.storage_name()), Some(*item));
        }
        assert_eq!(StorageItem::StakeFrom.storage_name(), "StakeFrom");
        assert_eq!(StorageItem::Account.module(), "System");
    }

    #[test]
    fn camel_case_conversion() {
        assert_eq!(camel_case("stake_from"), "StakeFrom");
        assert_eq!(camel_case("max_allowed_uids"), "MaxAllowedUids");
        assert_eq!(camel_case("tempo"), "Tempo");
    }

    #[test]
    fn names_resolve_through_registry_first() {
        assert_eq!(
            resolve_name("account", SUBSPACE_MODULE),
            ("System".to_string(), "Account".to_string())
        );
        assert_eq!(
            resolve_name("Account", SUBSPACE_MODULE),
            ("System".to_string(), "Account".to_string())
        );
        assert_eq!(
            resolve_name("pending_emission", SUBSPACE_MODULE),
            ("SubspaceModule".to_string(), "PendingEmission".to_string())
        );
        assert_eq!(
            resolve_name("CustomThing", "Other"),
            ("Other".to_string(), "CustomThing".to_string())
        );
    }
}
