//! Wrap backend backed by an operator-supplied key-encryption key.
//!
//! Pure local computation: AES-256-GCM over the DEK bytes with a fresh
//! random nonce per wrap call. Never blocks.

use async_trait::async_trait;
use common::CryptoError;

use crate::crypto::{self, DekBytes};

use super::{KeyWrapBackend, WrapScheme, WrappedDek};

/// Local AES-256-GCM wrap backend keyed by the environment KEK.
pub struct EnvKekBackend {
    kek: DekBytes,
}

impl EnvKekBackend {
    /// Build a backend around the given KEK.
    pub fn new(kek: DekBytes) -> Self {
        Self { kek }
    }

    /// Build a backend from a standard-base64 KEK string (32 bytes decoded).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidRequest`] for malformed base64 and
    /// [`CryptoError::InvalidKeyLength`] for a decoded key of the wrong size.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidRequest("KEK is not valid base64".into()))?;
        let kek = DekBytes::from_slice(&bytes).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::new(kek))
    }
}

#[async_trait]
impl KeyWrapBackend for EnvKekBackend {
    fn scheme(&self) -> WrapScheme {
        WrapScheme::EnvKek
    }

    async fn wrap(&self, dek: &DekBytes) -> Result<WrappedDek, CryptoError> {
        let sealed = crypto::cipher::encrypt(dek.as_bytes(), &self.kek)
            .map_err(|_| CryptoError::Storage("KEK wrap failed".into()))?;
        Ok(WrappedDek {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            scheme: WrapScheme::EnvKek,
            kms_key_id: None,
        })
    }

    async fn unwrap_dek(&self, wrapped: &WrappedDek) -> Result<DekBytes, CryptoError> {
        let value = crypto::cipher::value_from_parts(wrapped.ciphertext.clone(), &wrapped.nonce)
            .map_err(|_| CryptoError::UnwrapAuth)?;
        let plaintext =
            crypto::cipher::decrypt(&value, &self.kek).map_err(|_| CryptoError::UnwrapAuth)?;
        DekBytes::from_slice(&plaintext).map_err(|_| CryptoError::UnwrapAuth)
    }
}
