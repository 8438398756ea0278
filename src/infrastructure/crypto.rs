use crate::domain::silver::EncryptedValue;
use crate::error::PipelineError;
use crate::infrastructure::kms::Kms;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::sync::Arc;

pub const AEAD_ALGORITHM: &str = "AES-256-GCM";

const NONCE_LEN: usize = 12;

/// Authenticated field-level encryption for sensitive values.
///
/// Keys are resolved through the KMS per operation and dropped afterwards;
/// the encryptor holds no key material of its own.
pub struct FieldEncryptor {
    kms: Arc<dyn Kms>,
}

impl FieldEncryptor {
    pub fn new(kms: Arc<dyn Kms>) -> Self {
        Self { kms }
    }

    /// Encrypt a field value into an opaque envelope.
    ///
    /// The envelope wire form is hex of `nonce (12 bytes) || ciphertext+tag`
    /// with the key reference and version carried alongside. Nonces are
    /// random per call and never reused with the same key.
    pub async fn encrypt_field(
        &self,
        key_ref: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedValue, PipelineError> {
        let handle = self.kms.resolve_key(key_ref).await?;

        let cipher = Aes256Gcm::new_from_slice(handle.bytes()).map_err(|e| {
            PipelineError::EncryptionFailed {
                message: e.to_string(),
            }
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext =
            cipher
                .encrypt(nonce, plaintext)
                .map_err(|e| PipelineError::EncryptionFailed {
                    message: e.to_string(),
                })?;

        let mut envelope = nonce_bytes.to_vec();
        envelope.extend(ciphertext);

        Ok(EncryptedValue {
            key_ref: key_ref.to_string(),
            key_version: handle.version(),
            algorithm: AEAD_ALGORITHM.to_string(),
            envelope: hex::encode(envelope),
        })
    }

    /// Decrypt an envelope back to the plaintext bytes.
    ///
    /// Failure is reported by key reference only; neither the envelope nor
    /// any partial plaintext appears in the error.
    pub async fn decrypt_field(&self, value: &EncryptedValue) -> Result<Vec<u8>, PipelineError> {
        let handle = self
            .kms
            .resolve_key_version(&value.key_ref, value.key_version)
            .await?;

        let raw = hex::decode(&value.envelope).map_err(|_| PipelineError::DecryptionFailed {
            key_ref: value.key_ref.clone(),
        })?;
        if raw.len() <= NONCE_LEN {
            return Err(PipelineError::DecryptionFailed {
                key_ref: value.key_ref.clone(),
            });
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(handle.bytes()).map_err(|_| {
            PipelineError::DecryptionFailed {
                key_ref: value.key_ref.clone(),
            }
        })?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| PipelineError::DecryptionFailed {
                key_ref: value.key_ref.clone(),
            })
    }
}
