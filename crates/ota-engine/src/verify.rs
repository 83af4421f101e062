//! Running SHA-256 over received image bytes

use ota_core::ImageDigest;
use sha2::{Digest, Sha256};

use crate::error::OtaError;

/// Incremental digest for one session. `finalize` succeeds exactly once.
pub struct IntegrityVerifier {
    hasher: Option<Sha256>,
    bytes: u64,
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self {
            hasher: Some(Sha256::new()),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let hasher = self.hasher.as_mut().ok_or(OtaError::DigestConsumed)?;
        hasher.update(data);
        self.bytes += data.len() as u64;
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<ImageDigest, OtaError> {
        let hasher = self.hasher.take().ok_or(OtaError::DigestConsumed)?;
        Ok(ImageDigest(hasher.finalize().into()))
    }

    /// Bytes folded in so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_finalized(&self) -> bool {
        self.hasher.is_none()
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("bytes", &self.bytes)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
