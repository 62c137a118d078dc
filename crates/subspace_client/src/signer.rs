use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Failure(String),
}

/// Capability to authorise extrinsics.
pub trait Signer: Send + Sync {
    /// Public address the chain knows this signer by.
    fn address(&self) -> String;
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError>;
}

/// In-process ed25519 signer.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    pub fn from_hex(seed: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(seed.trim_start_matches("0x"))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

impl Signer for Keypair {
    fn address(&self) -> String {
        format!("0x{}", hex::encode(self.signing.verifying_key().to_bytes()))
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(self.signing.sign(payload).to_bytes().to_vec())
    }
}

/// Checks a signature produced by a [`Keypair`] against its hex address.
pub fn verify(address: &str, payload: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = hex::decode(address.trim_start_matches("0x")) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(payload, &sig).is_ok()
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Accepts `0x`-prefixed 32-byte hex keys and ss58-shaped base58 strings.
pub fn is_valid_address(candidate: &str) -> bool {
    if let Some(hex_part) = candidate.strip_prefix("0x") {
        return hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit());
    }
    (46..=48).contains(&candidate.len()) && candidate.chars().all(|c| BASE58_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::from_seed(&[7u8; 32]);
        let sig = kp.sign(b"payload").unwrap();
        assert!(verify(&kp.address(), b"payload", &sig));
        assert!(!verify(&kp.address(), b"other", &sig));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = Keypair::from_seed(&[1u8; 32]);
        let b = Keypair::from_hex(&hex::encode([1u8; 32])).unwrap();
        assert_eq!(a.address(), b.address());
        assert!(Keypair::from_hex("abcd").is_err());
    }

    #[test]
    fn address_shapes() {
        let kp = Keypair::generate();
        assert!(is_valid_address(&kp.address()));
        assert!(is_valid_address("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"));
        assert!(!is_valid_address("alice"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKut0Y"));
    }
}
