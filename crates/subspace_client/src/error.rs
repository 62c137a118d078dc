use thiserror::Error;

use crate::signer::SignerError;

/// Errors surfaced by the query client, the archive and the transaction
/// composer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to {target} failed after {attempts} attempts: {reason}")]
    Connection {
        target: String,
        attempts: u32,
        reason: String,
    },
    #[error("no {mode} endpoint configured for network {network}")]
    NoEndpoint { network: String, mode: String },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("query {module}.{name} failed: {reason}")]
    Query {
        module: String,
        name: String,
        reason: String,
    },
    #[error("unknown partition {0}")]
    UnknownPartition(String),
    #[error("unknown address {0}")]
    UnknownAddress(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error("extrinsic rejected: {0}")]
    Submission(String),
    #[error("cache entry {path} is corrupt: {reason}")]
    CacheCorruption { path: String, reason: String },
    #[error("unsupported snapshot migration from v{from} to v{to}")]
    UnsupportedMigration { from: u32, to: u32 },
    #[error("fetch incomplete, outstanding entries: {0:?}")]
    Incomplete(Vec<String>),
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub(crate) fn query(module: &str, name: &str, reason: impl ToString) -> Self {
        ClientError::Query {
            module: module.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(name: &str, reason: impl ToString) -> Self {
        ClientError::InvalidParam {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connection { .. }
            | ClientError::Rpc { .. }
            | ClientError::Transport(_)
            | ClientError::Query { .. }
            | ClientError::Incomplete(_)
            | ClientError::Io(_) => true,
            _ => false,
        }
    }

    /// Caller-input failures that must be reported before anything is
    /// written or submitted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClientError::UnknownPartition(_)
                | ClientError::UnknownAddress(_)
                | ClientError::InvalidParam { .. }
        )
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_validation_do_not_overlap() {
        let errors = vec![
            ClientError::Connection {
                target: "http://n".into(),
                attempts: 3,
                reason: "refused".into(),
            },
            ClientError::query("SubspaceModule", "Keys", "boom"),
            ClientError::UnknownPartition("nope".into()),
            ClientError::UnknownAddress("bob".into()),
            ClientError::invalid("amount", "negative"),
            ClientError::UnsupportedMigration { from: 2, to: 9 },
        ];
        for err in errors {
            assert!(!(err.is_transient() && err.is_validation()), "{err}");
        }
    }

    #[test]
    fn display_includes_context() {
        let err = ClientError::UnsupportedMigration { from: 1, to: 3 };
        assert_eq!(err.to_string(), "unsupported snapshot migration from v1 to v3");
    }
}
