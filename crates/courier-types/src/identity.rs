//! Ed25519 key pairs for overlay node identity.
//!
//! A node's network address is the hex encoding of its public key, so the
//! key pair and the address are one value. Key pairs are plain values built
//! once and passed explicitly; there is no process-wide key store.

use crate::envelope::Address;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

/// An Ed25519 signing key and its public half.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from OS entropy.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key pair from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self, String> {
        let bytes = Zeroizing::new(
            hex::decode(secret.trim()).map_err(|e| format!("invalid key hex: {e}"))?,
        );
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| "invalid secret key length (expected 32 bytes)".to_string())?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Read a hex secret from a key file (surrounding whitespace ignored).
    pub fn from_key_file(path: &Path) -> Result<Self, String> {
        let contents = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read key file {}: {e}", path.display()))?,
        );
        Self::from_secret_hex(&contents)
    }

    /// Hex-encoded secret key.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Hex-encoded public key.
    pub fn public_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// The network address derived from this key pair.
    pub fn address(&self) -> Address {
        Address::new(self.public_hex())
    }

    /// Secret and public key hex concatenated, as handed to the node process.
    pub fn identity_string(&self) -> Zeroizing<String> {
        let mut s = self.secret_hex();
        s.push_str(&self.public_hex());
        s
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_public_key_hex() {
        let key = KeyPair::generate();
        assert_eq!(key.address().as_str(), key.public_hex());
        assert_eq!(key.public_hex().len(), 64);
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&key.secret_hex()).unwrap();
        assert_eq!(restored.address(), key.address());
    }

    #[test]
    fn test_identity_string_is_secret_then_public() {
        let key = KeyPair::generate();
        let identity = key.identity_string();
        assert_eq!(identity.len(), 128);
        assert_eq!(&identity[..64], key.secret_hex().as_str());
        assert_eq!(&identity[64..], key.public_hex());
    }

    #[test]
    fn test_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let key = KeyPair::generate();
        std::fs::write(&path, format!("{}\n", key.secret_hex().as_str())).unwrap();
        let loaded = KeyPair::from_key_file(&path).unwrap();
        assert_eq!(loaded.public_hex(), key.public_hex());
    }

    #[test]
    fn test_bad_secret() {
        assert!(KeyPair::from_secret_hex("zz").is_err());
        assert!(KeyPair::from_secret_hex("abcd").unwrap_err().contains("length"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = KeyPair::generate();
        let debug = format!("{key:?}");
        assert!(!debug.contains(key.secret_hex().as_str()));
    }
}
