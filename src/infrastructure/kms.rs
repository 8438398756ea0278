use crate::error::PipelineError;
use async_trait::async_trait;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Days between scheduled key version bumps.
pub const KEY_ROTATION_DAYS: u32 = 30;

/// Resolved key material for one encryption or decryption operation.
///
/// The bytes live behind `Zeroizing` and the handle is expected to be
/// dropped as soon as the operation completes; nothing in the pipeline
/// stores a handle.
pub struct KeyHandle {
    key: Zeroizing<[u8; 32]>,
    version: u32,
}

impl KeyHandle {
    pub fn new(key: [u8; 32], version: u32) -> Self {
        Self {
            key: Zeroizing::new(key),
            version,
        }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes must never appear in debug output or logs.
        f.debug_struct("KeyHandle")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Key-management abstraction.
///
/// Implementations resolve opaque key references to key material. Rotation
/// bumps the current version; prior versions stay resolvable so existing
/// ciphertext envelopes remain decryptable.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Resolve the current key for a reference.
    async fn resolve_key(&self, key_ref: &str) -> Result<KeyHandle, PipelineError>;

    /// Resolve a specific historical version for decryption.
    async fn resolve_key_version(
        &self,
        key_ref: &str,
        version: u32,
    ) -> Result<KeyHandle, PipelineError>;
}

/// Master-key-derived KMS for development and tests.
///
/// Per-reference keys are derived as SHA3-256(master || key_ref || version),
/// so no key bytes are stored per reference and every version remains
/// resolvable after rotation.
pub struct LocalKms {
    master: Zeroizing<Vec<u8>>,
    versions: Arc<RwLock<HashMap<String, u32>>>,
}

impl LocalKms {
    pub fn new(master: Vec<u8>) -> Result<Self, PipelineError> {
        if master.len() != 32 {
            return Err(PipelineError::KeyResolution {
                message: "master key must be 32 bytes".to_string(),
            });
        }
        Ok(Self {
            master: Zeroizing::new(master),
            versions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn derive(&self, key_ref: &str, version: u32) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(self.master.as_slice());
        hasher.update(key_ref.as_bytes());
        hasher.update(version.to_be_bytes());
        hasher.finalize().into()
    }

    /// Bump the current version for a reference and return it.
    pub async fn rotate(&self, key_ref: &str) -> u32 {
        let mut versions = self.versions.write().await;
        let entry = versions.entry(key_ref.to_string()).or_insert(1);
        *entry += 1;
        *entry
    }
}

#[async_trait]
impl Kms for LocalKms {
    async fn resolve_key(&self, key_ref: &str) -> Result<KeyHandle, PipelineError> {
        let version = {
            let versions = self.versions.read().await;
            versions.get(key_ref).copied().unwrap_or(1)
        };
        Ok(KeyHandle::new(self.derive(key_ref, version), version))
    }

    async fn resolve_key_version(
        &self,
        key_ref: &str,
        version: u32,
    ) -> Result<KeyHandle, PipelineError> {
        if version == 0 {
            return Err(PipelineError::KeyResolution {
                message: format!("unknown key version {version} for ref {key_ref}"),
            });
        }
        let current = {
            let versions = self.versions.read().await;
            versions.get(key_ref).copied().unwrap_or(1)
        };
        if version > current {
            return Err(PipelineError::KeyResolution {
                message: format!("key version {version} for ref {key_ref} not yet issued"),
            });
        }
        Ok(KeyHandle::new(self.derive(key_ref, version), version))
    }
}
