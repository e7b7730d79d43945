//! Node addresses and key rings
//!
//! Every protocol message is attributed to the signature key of its sender.
//! A `PubKeyRing` is the public half that peers keep on file; a `KeyRing`
//! holds the signing key and never leaves the node.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed")]
    VerificationFailed,
}

// ============================================================================
// Node Address
// ============================================================================

/// Network address of a trading node (host:port, usually an onion service)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Key Rings
// ============================================================================

/// Public key material a peer keeps on file for another party
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    /// Hex-encoded ed25519 verifying key
    signature_pub_key: String,
}

impl PubKeyRing {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            signature_pub_key: hex::encode(key.to_bytes()),
        }
    }

    pub fn signature_pub_key_hex(&self) -> &str {
        &self.signature_pub_key
    }

    /// Short prefix used when logging which party a key belongs to
    pub fn short_id(&self) -> &str {
        let key = &self.signature_pub_key;
        match key.char_indices().nth(8) {
            Some((end, _)) => &key[..end],
            None => key,
        }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        let bytes = hex::decode(&self.signature_pub_key)
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey("expected 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
    }

    /// Verify a hex-encoded signature over `data`
    pub fn verify(&self, data: &[u8], signature_hex: &str) -> Result<(), KeyError> {
        let key = self.verifying_key()?;
        let bytes =
            hex::decode(signature_hex).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let signature =
            Signature::from_slice(&bytes).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        key.verify(data, &signature)
            .map_err(|_| KeyError::VerificationFailed)
    }
}

/// Private signing key of this node
pub struct KeyRing {
    signing_key: SigningKey,
}

impl KeyRing {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        PubKeyRing::from_verifying_key(&self.signing_key.verifying_key())
    }

    /// Sign `data`, returning the hex-encoded signature
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring().short_id().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let key_ring = KeyRing::generate();
        let signature = key_ring.sign(b"contract");
        assert!(key_ring.pub_key_ring().verify(b"contract", &signature).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let signer = KeyRing::generate();
        let other = KeyRing::generate();
        let signature = signer.sign(b"contract");
        assert_eq!(
            other.pub_key_ring().verify(b"contract", &signature),
            Err(KeyError::VerificationFailed)
        );
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let key_ring = KeyRing::generate();
        let signature = key_ring.sign(b"amount=100");
        assert!(key_ring.pub_key_ring().verify(b"amount=101", &signature).is_err());
    }

    #[test]
    fn test_malformed_signature_hex() {
        let key_ring = KeyRing::generate();
        let result = key_ring.pub_key_ring().verify(b"x", "zz");
        assert!(matches!(result, Err(KeyError::InvalidSignature(_))));
    }

    #[test]
    fn test_deterministic_key_from_secret() {
        let a = KeyRing::from_secret_bytes(&[7u8; 32]);
        let b = KeyRing::from_secret_bytes(&[7u8; 32]);
        assert_eq!(a.pub_key_ring(), b.pub_key_ring());
        assert_eq!(a.pub_key_ring().short_id().len(), 8);
    }

    #[test]
    fn test_short_id_of_malformed_key() {
        let ring: PubKeyRing =
            serde_json::from_str(r#"{"signature_pub_key":"ééééééééé"}"#).unwrap();
        assert_eq!(ring.short_id(), "éééééééé");
        assert!(ring.verifying_key().is_err());
    }
}
