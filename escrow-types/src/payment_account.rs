//! Payment account payloads
//!
//! A trader's bank or crypto account details are shared sealed with a random
//! ChaCha20Poly1305 key at contract time; only the hash enters the contract.
//! The key is revealed later (the seller's once deposits confirm), so the
//! counterparty learns where to pay only when the funds are locked.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// ChaCha20Poly1305 nonce size (12 bytes)
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Payload hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAccountPayload {
    pub id: String,
    pub payment_method_id: String,
    pub holder_name: String,
    pub account_number: String,
}

impl PaymentAccountPayload {
    /// SHA-256 over the JSON form, hex encoded
    pub fn hash(&self) -> Result<String, PayloadError> {
        let json =
            serde_json::to_vec(self).map_err(|e| PayloadError::Serialization(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&json)))
    }
}

/// Sealed payment account payload as sent to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub nonce: String,
    pub ciphertext: String,
}

/// Seal a payload under a fresh random key. Returns the ciphertext and the hex key.
pub fn seal_payment_account_payload(
    payload: &PaymentAccountPayload,
) -> Result<(EncryptedPayload, String), PayloadError> {
    let key: [u8; 32] = rand::random();
    let nonce_bytes: [u8; NONCE_SIZE] = rand::random();

    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| PayloadError::InvalidKey(e.to_string()))?;
    let plaintext =
        serde_json::to_vec(payload).map_err(|e| PayloadError::Serialization(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| PayloadError::Serialization("encryption failed".to_string()))?;

    Ok((
        EncryptedPayload {
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        },
        hex::encode(key),
    ))
}

/// Open a sealed payload with its hex key
pub fn open_payment_account_payload(
    encrypted: &EncryptedPayload,
    key_hex: &str,
) -> Result<PaymentAccountPayload, PayloadError> {
    let key = hex::decode(key_hex).map_err(|e| PayloadError::InvalidKey(e.to_string()))?;
    let nonce =
        hex::decode(&encrypted.nonce).map_err(|e| PayloadError::InvalidEncoding(e.to_string()))?;
    if nonce.len() != NONCE_SIZE {
        return Err(PayloadError::InvalidEncoding(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    let ciphertext = hex::decode(&encrypted.ciphertext)
        .map_err(|e| PayloadError::InvalidEncoding(e.to_string()))?;

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|e| PayloadError::InvalidKey(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| PayloadError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|e| PayloadError::Serialization(e.to_string()))
}

/// Open a sealed payload and check it against the hash committed in the contract
pub fn open_and_verify_payload(
    encrypted: &EncryptedPayload,
    key_hex: &str,
    expected_hash: &str,
) -> Result<PaymentAccountPayload, PayloadError> {
    let payload = open_payment_account_payload(encrypted, key_hex)?;
    let actual = payload.hash()?;
    if actual != expected_hash {
        return Err(PayloadError::HashMismatch {
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sepa_account() -> PaymentAccountPayload {
        PaymentAccountPayload {
            id: "acct-1".to_string(),
            payment_method_id: "SEPA".to_string(),
            holder_name: "Alice Example".to_string(),
            account_number: "DE89370400440532013000".to_string(),
        }
    }

    #[test]
    fn test_seal_and_open() {
        let payload = sepa_account();
        let (sealed, key) = seal_payment_account_payload(&payload).unwrap();
        let opened = open_payment_account_payload(&sealed, &key).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (sealed, _) = seal_payment_account_payload(&sepa_account()).unwrap();
        let wrong_key = hex::encode([1u8; 32]);
        assert_eq!(
            open_payment_account_payload(&sealed, &wrong_key),
            Err(PayloadError::DecryptionFailed)
        );
    }

    #[test]
    fn test_hash_commitment_checked() {
        let payload = sepa_account();
        let (sealed, key) = seal_payment_account_payload(&payload).unwrap();
        let hash = payload.hash().unwrap();
        assert!(open_and_verify_payload(&sealed, &key, &hash).is_ok());

        let result = open_and_verify_payload(&sealed, &key, "deadbeef");
        assert!(matches!(result, Err(PayloadError::HashMismatch { .. })));
    }

    #[test]
    fn test_bad_nonce_length() {
        let (mut sealed, key) = seal_payment_account_payload(&sepa_account()).unwrap();
        sealed.nonce = "0011".to_string();
        assert!(matches!(
            open_payment_account_payload(&sealed, &key),
            Err(PayloadError::InvalidEncoding(_))
        ));
    }
}
