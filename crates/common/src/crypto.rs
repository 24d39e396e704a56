//! Package signing for uvnet
//!
//! Ed25519 signing and verification for the per-cell configuration packages
//! published by the registry.

use crate::{Error, Result};
use ed25519_dalek::{
    Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ed25519 key pair for signing
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Load key pair from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        let bytes: [u8; 32] = data
            .try_into()
            .map_err(|_| Error::Crypto("Invalid key length".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Save key pair to file, mode 0600
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::exec::write_private(path.as_ref(), &self.signing_key.to_bytes())
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign the given data
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Create a verifying key from raw bytes
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Crypto(e.to_string()))
}

/// Signed data wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedData<T> {
    pub data: T,
    pub signature: String,
    pub signer_public_key: String,
}

impl<T: Serialize> SignedData<T> {
    /// Create new signed data
    pub fn new(data: T, signer: &KeyPair) -> Result<Self> {
        let serialized = serde_json::to_vec(&data)?;
        let signature = hex::encode(signer.sign(&serialized));
        Ok(Self {
            data,
            signature,
            signer_public_key: signer.public_key_hex(),
        })
    }

    /// Verify the signature against the embedded public key
    pub fn verify(&self) -> Result<()> {
        let public_key_bytes = hex::decode(&self.signer_public_key)
            .map_err(|e| Error::Crypto(format!("Invalid public key hex: {}", e)))?;
        let verifying_key = verifying_key_from_bytes(&public_key_bytes)?;
        let sig_bytes = hex::decode(&self.signature)
            .map_err(|e| Error::Crypto(format!("Invalid signature hex: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| Error::Crypto("Invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        let serialized = serde_json::to_vec(&self.data)?;
        DalekVerifier::verify(&verifying_key, &serialized, &sig)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = KeyPair::generate();
        let signed = SignedData::new(vec![1u8, 2, 3], &kp).unwrap();
        signed.verify().unwrap();
    }

    #[test]
    fn test_tampered_data_fails() {
        let kp = KeyPair::generate();
        let mut signed = SignedData::new(vec![1u8, 2, 3], &kp).unwrap();
        signed.data[0] = 42;
        assert!(signed.verify().is_err());
    }

    #[test]
    fn test_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");
        let kp = KeyPair::generate();
        kp.save(&path).unwrap();
        let loaded = KeyPair::load(&path).unwrap();
        assert_eq!(kp.public_key_hex(), loaded.public_key_hex());
    }
}
