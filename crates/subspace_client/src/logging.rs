use sha2::{Digest, Sha256};

/// Derive a short correlation ID from a cache path or other stable key.
pub fn corr_id_key(key: &str) -> String {
    let h = Sha256::digest(key.as_bytes());
    hex::encode(&h[0..8])
}

/// Random correlation identifier for spans without a stable key.
pub fn corr_id_random() -> String {
    use rand::{rngs::OsRng, RngCore};
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[macro_export]
macro_rules! log_context {
    (query = $path:expr) => {
        ::tracing::info_span!(
            "query",
            path = %$path,
            correlation_id = %$crate::logging::corr_id_key(&$path)
        )
    };
    (tx = $id:expr) => {
        ::tracing::info_span!("tx", correlation_id = %$id)
    };
    (snapshot = $network:expr) => {
        ::tracing::info_span!(
            "snapshot",
            network = %$network,
            correlation_id = %$crate::logging::corr_id_random()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ids_are_stable_and_short() {
        let a = corr_id_key("query/main/SubspaceModule.Tempo");
        assert_eq!(a, corr_id_key("query/main/SubspaceModule.Tempo"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, corr_id_key("query/main/SubspaceModule.Keys"));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(corr_id_random(), corr_id_random());
    }
}
