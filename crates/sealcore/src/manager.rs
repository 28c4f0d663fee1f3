//! Key manager: resolves labels to plaintext DEKs and serves field
//! encryption for the rest of the application.
//!
//! Plaintext DEKs are cached in memory, keyed by the key row's immutable
//! `id` so entries stay valid across label transitions (promote relabels
//! rows, it does not change key material). The cache is additive-only: a
//! retired generation's DEK stays needed until every record under it has
//! been migrated, so nothing is evicted during a process lifetime.
//!
//! Readiness: not-ready until the first successful write-DEK resolution,
//! then ready; an authentication failure while unwrapping any DEK marks the
//! manager permanently failed until operator intervention. Transient
//! backend outages do not change the state.

use std::collections::HashMap;

use common::CryptoError;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::crypto::{self, DekBytes, EncryptedValue};
use crate::records::TableRegistry;
use crate::store::{EncryptionKey, KeyStore};
use crate::wrap::Backends;

/// Readiness of the crypto subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The active DEK has not been unwrapped yet this process.
    NotReady,
    /// The active DEK unwrapped successfully at least once.
    Ready,
    /// An unwrap failed authentication; wrong key material is loaded.
    /// Stays failed until the operator restores the correct KEK/KMS key.
    Failed,
}

/// Resolves labels to DEKs and encrypts/decrypts field values.
pub struct KeyManager {
    store: KeyStore,
    backends: Backends,
    cache: RwLock<HashMap<String, DekBytes>>,
    ready: std::sync::RwLock<ReadyState>,
}

impl KeyManager {
    /// Build a manager over the given store and backend registry.
    pub fn new(store: KeyStore, backends: Backends) -> Self {
        Self {
            store,
            backends,
            cache: RwLock::new(HashMap::new()),
            ready: std::sync::RwLock::new(ReadyState::NotReady),
        }
    }

    /// The store this manager resolves against.
    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// The configured backend registry.
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Current readiness.
    pub fn ready_state(&self) -> ReadyState {
        *self.ready.read().expect("ready lock poisoned")
    }

    /// `true` once the active DEK has been unwrapped this process.
    pub fn is_ready(&self) -> bool {
        self.ready_state() == ReadyState::Ready
    }

    /// Resolve the DEK every new write must encrypt under.
    ///
    /// Reads the settings row for the current write label, then unwraps (or
    /// serves from cache) that label's DEK. The first success flips
    /// readiness to [`ReadyState::Ready`].
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] before bootstrap, plus any unwrap error.
    pub async fn resolve_write_dek(&self) -> Result<(DekBytes, String), CryptoError> {
        let label = self
            .store
            .write_label()
            .await?
            .ok_or_else(|| CryptoError::KeyNotFound("active".into()))?;
        let key = self.store.get_by_label(&label).await?;
        let dek = self.dek_for_key(&key).await?;
        self.mark_ready();
        Ok((dek, label))
    }

    /// Resolve the DEK for an arbitrary historical label found on a record.
    ///
    /// Active, retired, and rotating labels are all resolvable at the same
    /// time; reads can hit records encrypted under any generation.
    pub async fn resolve_read_dek(&self, enc_label: &str) -> Result<DekBytes, CryptoError> {
        let key = self.store.get_by_label(enc_label).await?;
        self.dek_for_key(&key).await
    }

    /// Encrypt a field value under the current write label.
    ///
    /// Returns the ciphertext/nonce pair plus the label the caller must
    /// record on the owning row.
    pub async fn encrypt_field(
        &self,
        plaintext: &[u8],
    ) -> Result<(EncryptedValue, String), CryptoError> {
        let (dek, label) = self.resolve_write_dek().await?;
        let value = crypto::cipher::encrypt(plaintext, &dek)
            .map_err(|_| CryptoError::Storage("field encryption failed".into()))?;
        Ok((value, label))
    }

    /// Decrypt a field value under the label recorded on its owning row.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Decrypt`] on authentication failure, i.e. corrupt
    /// ciphertext or a label pointing at the wrong key. Never silently
    /// substitutes a default.
    pub async fn decrypt_field(
        &self,
        value: &EncryptedValue,
        enc_label: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let dek = self.resolve_read_dek(enc_label).await?;
        crypto::cipher::decrypt(value, &dek).map_err(|_| CryptoError::Decrypt)
    }

    /// Fetch the plaintext DEK for a key row, unwrapping on cache miss.
    ///
    /// Population is serialised under the cache write lock, so concurrent
    /// misses for one label unwrap once.
    pub(crate) async fn dek_for_key(&self, key: &EncryptionKey) -> Result<DekBytes, CryptoError> {
        if let Some(dek) = self.cache.read().await.get(&key.id) {
            return Ok(dek.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(dek) = cache.get(&key.id) {
            return Ok(dek.clone());
        }

        let backend = self.backends.for_scheme(key.wrapped.scheme)?;
        match backend.unwrap_dek(&key.wrapped).await {
            Ok(dek) => {
                cache.insert(key.id.clone(), dek.clone());
                Ok(dek)
            }
            Err(CryptoError::UnwrapAuth) => {
                error!(label = %key.label, "DEK unwrap failed authentication; marking crypto permanently not-ready");
                self.poison();
                Err(CryptoError::UnwrapAuth)
            }
            Err(e) => {
                warn!(label = %key.label, error = %e, "DEK unwrap failed");
                Err(e)
            }
        }
    }

    /// Generate and activate a brand-new DEK, bypassing rotation.
    ///
    /// The escape hatch for a fresh bootstrap or for wrong key material
    /// discovered before any data was encrypted. Refused while encrypted
    /// records exist. Success counts as operator intervention: a previously
    /// failed readiness state is cleared.
    ///
    /// # Errors
    ///
    /// [`CryptoError::EncryptedRecordsExist`] when any encrypted record
    /// exists; [`CryptoError::RotationAlreadyInProgress`] while a rotation
    /// is open.
    pub async fn force_new_active_dek(
        &self,
        registry: &TableRegistry,
    ) -> Result<EncryptionKey, CryptoError> {
        let dek = DekBytes::generate();
        let backend = self.backends.active()?;
        let wrapped = backend.wrap(&dek).await?;

        let key = self.store.force_activate(wrapped, registry).await?;
        self.prime_cache(&key.id, dek).await;
        *self.ready.write().expect("ready lock poisoned") = ReadyState::Ready;

        warn!(id = %key.id, scheme = %key.wrapped.scheme, "forced a brand-new active DEK");
        Ok(key)
    }

    /// Seed the cache with an already-unwrapped DEK (used by rewrap so the
    /// active key keeps serving after its wrapping changed).
    pub(crate) async fn prime_cache(&self, key_id: &str, dek: DekBytes) {
        self.cache.write().await.insert(key_id.to_owned(), dek);
    }

    fn mark_ready(&self) {
        let mut state = self.ready.write().expect("ready lock poisoned");
        if *state != ReadyState::Failed {
            *state = ReadyState::Ready;
        }
    }

    fn poison(&self) {
        *self.ready.write().expect("ready lock poisoned") = ReadyState::Failed;
    }
}
