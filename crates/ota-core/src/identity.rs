//! Device identity and update credential
//!
//! The identity is supplied once at startup and stays immutable for the
//! lifetime of the process. Only the SHA-256 hash of the update password is
//! kept in memory.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::digest::DIGEST_LEN;

/// Hashed update password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    hash: [u8; DIGEST_LEN],
}

impl Credential {
    /// Hash a clear-text password.
    pub fn from_password(password: &str) -> Self {
        Self {
            hash: hash_secret(password.as_bytes()),
        }
    }

    /// Use a pre-computed SHA-256 password hash (hex encoded).
    pub fn from_hash_hex(hash: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hash.trim(), &mut bytes)?;
        Ok(Self { hash: bytes })
    }

    /// Check a presented secret. Comparison time does not depend on where
    /// the hashes differ.
    pub fn verify(&self, presented: &[u8]) -> bool {
        let candidate = hash_secret(presented);
        candidate[..].ct_eq(&self.hash[..]).into()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

fn hash_secret(secret: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().into()
}

/// Name and optional credential of the device being updated.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub name: String,
    pub credential: Option<Credential>,
}

impl DeviceIdentity {
    /// Identity without authentication.
    pub fn open(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: None,
        }
    }

    /// Identity requiring the given password.
    pub fn with_password(name: impl Into<String>, password: &str) -> Self {
        Self {
            name: name.into(),
            credential: Some(Credential::from_password(password)),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.credential.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_verification() {
        let cred = Credential::from_password("s3cret");
        assert!(cred.verify(b"s3cret"));
        assert!(!cred.verify(b"s3cre"));
        assert!(!cred.verify(b""));
    }

    #[test]
    fn test_near_miss_hash_rejected() {
        let cred = Credential::from_password("admin");
        let mut hash = hash_secret(b"admin");
        hash[DIGEST_LEN - 1] ^= 0x01;
        let near = Credential { hash };
        assert_ne!(cred, near);
        assert!(!near.verify(b"admin"));
        assert!(cred.verify(b"admin"));
    }

    #[test]
    fn test_hash_hex_matches_password() {
        // sha256("admin")
        let cred = Credential::from_hash_hex(
            "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918",
        )
        .unwrap();
        assert_eq!(cred, Credential::from_password("admin"));
    }

    #[test]
    fn test_debug_does_not_leak_hash() {
        let identity = DeviceIdentity::with_password("sensor-1", "pw");
        assert!(format!("{:?}", identity).contains("<redacted>"));
        assert!(identity.requires_auth());
        assert!(!DeviceIdentity::open("sensor-1").requires_auth());
    }
}
