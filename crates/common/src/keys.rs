//! WireGuard key material
//!
//! Curve25519 keypairs and preshared keys, base64-encoded the way the
//! userspace tools expect them. Every key carries a `<prefix>:<scope>` id and
//! a `dropped` flag; dropped keys stay in the store until explicitly cleaned
//! so that agents holding a previous configuration can still decrypt
//! in-flight material.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// A WireGuard asymmetric keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub key_id: String,
    pub public: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub private: String,
    #[serde(default)]
    pub dropped: bool,
}

impl WgKeyPair {
    /// Generate a fresh keypair under the given id
    pub fn generate(key_id: impl Into<String>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            key_id: key_id.into(),
            public: BASE64.encode(public.as_bytes()),
            private: BASE64.encode(secret.to_bytes()),
            dropped: false,
        }
    }

    /// Copy with the private half stripped, for public serialization
    pub fn public_only(&self) -> Self {
        Self {
            key_id: self.key_id.clone(),
            public: self.public.clone(),
            private: String::new(),
            dropped: self.dropped,
        }
    }
}

impl std::fmt::Display for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (dropped={})", self.key_id, self.dropped)
    }
}

/// A WireGuard preshared key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgPsk {
    pub key_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub value: String,
    #[serde(default)]
    pub dropped: bool,
}

impl WgPsk {
    /// Generate a fresh preshared key under the given id
    pub fn generate(key_id: impl Into<String>) -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            key_id: key_id.into(),
            value: BASE64.encode(bytes),
            dropped: false,
        }
    }

    pub fn public_only(&self) -> Self {
        Self {
            key_id: self.key_id.clone(),
            value: String::new(),
            dropped: self.dropped,
        }
    }
}

impl std::fmt::Display for WgPsk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (dropped={})", self.key_id, self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_encoding() {
        let kp = WgKeyPair::generate("u1:vpn:root:root");
        assert_eq!(BASE64.decode(&kp.public).unwrap().len(), 32);
        assert_eq!(BASE64.decode(&kp.private).unwrap().len(), 32);
        assert!(!kp.dropped);
    }

    #[test]
    fn test_public_serialization_strips_secrets() {
        let kp = WgKeyPair::generate("u1:vpn:root:root");
        let json = serde_json::to_string(&kp.public_only()).unwrap();
        assert!(!json.contains("private"));

        let psk = WgPsk::generate("u1:vpn:root:psks:0-1");
        let json = serde_json::to_string(&psk.public_only()).unwrap();
        assert!(!json.contains("value"));
    }

    #[test]
    fn test_keypairs_are_distinct() {
        let a = WgKeyPair::generate("k");
        let b = WgKeyPair::generate("k");
        assert_ne!(a.private, b.private);
        assert_ne!(a.public, b.public);
    }
}
