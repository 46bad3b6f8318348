// src/asserts/keys.rs

//! Signing keys for assertions
//!
//! Ed25519 throughout. Public keys travel base64-encoded in assertion
//! headers; a key is identified by the hex SHA-256 of its raw bytes.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// A public key together with its derived identifier
#[derive(Debug, Clone)]
pub struct PublicKey {
    key: VerifyingKey,
    id: String,
}

impl PublicKey {
    /// Decode from the base64 header encoding
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::AssertParse(format!("invalid public key encoding: {}", e)))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::AssertParse("invalid public key length".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::AssertParse(format!("invalid public key: {}", e)))?;
        Ok(Self::from_verifying_key(key))
    }

    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        let id = key_id(key.as_bytes());
        Self { key, id }
    }

    /// Self-computed fingerprint: hex SHA-256 of the raw key bytes
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base64 header encoding
    pub fn encode(&self) -> String {
        BASE64.encode(self.key.as_bytes())
    }

    /// Verify a detached base64 signature over `content`
    pub fn verify(&self, content: &[u8], signature_b64: &str) -> Result<()> {
        let raw = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| Error::AssertSignature(format!("invalid signature encoding: {}", e)))?;
        let sig = ed25519_dalek::Signature::from_slice(&raw)
            .map_err(|e| Error::AssertSignature(format!("invalid signature: {}", e)))?;
        self.key
            .verify(content, &sig)
            .map_err(|_| Error::AssertSignature(format!("key {} rejected content", self.id)))
    }
}

/// A private signing key, used by tests and provisioning tools
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign content, returning the detached base64 signature
    pub fn sign(&self, content: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(content).to_bytes())
    }
}

fn key_id(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate();
        let content = b"type: model\nauthority-id: brand";
        let sig = pair.sign(content);

        pair.public_key().verify(content, &sig).unwrap();
        assert!(pair.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pair = KeyPair::generate();
        let encoded = pair.public_key().encode();

        let decoded = PublicKey::decode(&encoded).unwrap();
        assert_eq!(decoded.id(), pair.public_key().id());
    }

    #[test]
    fn test_key_id_is_hex_sha256() {
        let pair = KeyPair::generate();
        let id = pair.public_key().id().to_string();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_garbage_key_rejected() {
        assert!(PublicKey::decode("not base64 !!!").is_err());
        assert!(PublicKey::decode(&BASE64.encode(b"short")).is_err());
    }
}
