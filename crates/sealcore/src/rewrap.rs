//! Rewrap: change how the active DEK is wrapped without touching any
//! encrypted record.
//!
//! Two cases, both single-row mutations: replacing the operator KEK, and
//! migrating the wrapping from the KEK to an external KMS. The DEK itself
//! never changes, so no record's `enc_label` changes and nothing is
//! re-encrypted. The row is written only after the new wrap succeeded;
//! any failure leaves it unmodified.

use std::sync::Arc;

use common::CryptoError;
use tracing::info;

use crate::crypto::DekBytes;
use crate::manager::KeyManager;
use crate::store::EncryptionKey;
use crate::wrap::env_kek::EnvKekBackend;
use crate::wrap::kms::KmsBackend;
use crate::wrap::KeyWrapBackend;

/// Performs in-place wrap mutations on the active key row.
pub struct RewrapManager {
    manager: Arc<KeyManager>,
}

impl RewrapManager {
    /// Build a rewrap manager over the key manager's store and backends.
    pub fn new(manager: Arc<KeyManager>) -> Self {
        Self { manager }
    }

    /// Re-wrap the active DEK under a replacement KEK.
    ///
    /// The process must be restarted with the new KEK configured before the
    /// next cold start; until then the cached plaintext DEK keeps serving.
    pub async fn rewrap_with_new_kek(&self, new_kek: DekBytes) -> Result<EncryptionKey, CryptoError> {
        let replacement = EnvKekBackend::new(new_kek);
        self.rewrap_to(&replacement).await
    }

    /// Migrate the active DEK's wrapping from the KEK to the given KMS key.
    pub async fn rewrap_to_kms(&self, kms: &KmsBackend) -> Result<EncryptionKey, CryptoError> {
        self.rewrap_to(kms).await
    }

    async fn rewrap_to(&self, target: &dyn KeyWrapBackend) -> Result<EncryptionKey, CryptoError> {
        let active = self.manager.store().get_active().await?;

        // Unwrap under the current backend (also primes the cache, so the
        // active key keeps serving even before a config change lands).
        let dek = self.manager.dek_for_key(&active).await?;

        let wrapped = target.wrap(&dek).await?;
        self.manager
            .store()
            .update_wrap_fields("active", wrapped.clone())
            .await?;

        info!(
            from = %active.wrapped.scheme,
            to = %wrapped.scheme,
            "active DEK rewrapped in place"
        );
        Ok(EncryptionKey {
            wrapped,
            ..active
        })
    }
}
