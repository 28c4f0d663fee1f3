//! Rotation orchestrator: re-encrypt every record under a freshly generated
//! DEK, in bounded resumable batches.
//!
//! The workflow is `begin → run (repeatable) → finalize`. Progress lives
//! entirely in durable state (the write label plus each record's
//! `enc_label`), so an interrupted rotation resumes from exactly where it
//! stopped, across process restarts, with no in-memory job tracking. There
//! is no limit on how long a rotation may stay open.

use std::sync::Arc;

use common::CryptoError;
use tracing::info;

use crate::crypto::{self, DekBytes};
use crate::manager::KeyManager;
use crate::records::{self, TableRegistry};
use crate::store::{EncryptionKey, KeyLabel};

/// Batch size used when the caller does not specify one.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Outcome of one `run` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Records re-encrypted by this invocation.
    pub migrated: u64,
    /// Records still encrypted under a previous key afterwards.
    pub remaining: u64,
}

/// Drives the three rotation phases against the key store and records.
pub struct RotationOrchestrator {
    manager: Arc<KeyManager>,
    registry: TableRegistry,
}

impl RotationOrchestrator {
    /// Build an orchestrator over the registered tables.
    pub fn new(manager: Arc<KeyManager>, registry: TableRegistry) -> Self {
        Self { manager, registry }
    }

    /// Begin a rotation: generate a fresh DEK, wrap it under the currently
    /// configured backend, insert it as `rotating::<ts>`, and repoint the
    /// write label at it. From this instant all new writes use the new DEK.
    ///
    /// # Errors
    ///
    /// [`CryptoError::RotationAlreadyInProgress`] if a rotation is open;
    /// [`CryptoError::KeyNotFound`] before bootstrap.
    pub async fn begin(&self) -> Result<EncryptionKey, CryptoError> {
        let dek = DekBytes::generate();
        let backend = self.manager.backends().active()?;
        let wrapped = backend.wrap(&dek).await?;

        let key = self.manager.store().insert_rotating(wrapped).await?;
        // The plaintext is already in hand; skip the unwrap round-trip.
        self.manager.prime_cache(&key.id, dek).await;

        info!(label = %key.label, scheme = %key.wrapped.scheme, "rotation begun; write label repointed");
        Ok(key)
    }

    /// Migrate up to `batch_size` records to the rotating key.
    ///
    /// Records are selected by `enc_label != write_label`, so re-running
    /// after an interruption skips everything already migrated. Each
    /// table's chunk commits in one transaction; a crash loses at most the
    /// in-flight chunk.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoRotationInProgress`] without an open rotation;
    /// decryption failures propagate and abort the batch.
    pub async fn run(&self, batch_size: Option<usize>) -> Result<RunReport, CryptoError> {
        let rotating = self
            .manager
            .store()
            .rotating()
            .await?
            .ok_or(CryptoError::NoRotationInProgress)?;
        let write_label = rotating.label.to_string();
        let new_dek = self.manager.dek_for_key(&rotating).await?;

        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
        let mut budget = batch_size;
        let mut migrated = 0u64;

        for table in self.registry.iter() {
            if budget == 0 {
                break;
            }
            let snapshot = {
                let table = table.clone();
                let write_label = write_label.clone();
                self.manager
                    .store()
                    .run(move |conn| {
                        records::select_unmigrated(conn, &table, &write_label, budget)
                            .map_err(|e| CryptoError::Storage(e.to_string()))
                    })
                    .await?
            };
            if snapshot.is_empty() {
                continue;
            }

            // Re-encrypt outside the transaction; apply the whole chunk in one.
            let mut updates = Vec::with_capacity(snapshot.len());
            for record in &snapshot {
                let old_dek = self.manager.resolve_read_dek(&record.enc_label).await?;
                let mut fields = Vec::with_capacity(record.fields.len());
                for (column, ciphertext, nonce) in &record.fields {
                    let (Some(ciphertext), Some(nonce)) = (ciphertext, nonce) else {
                        continue;
                    };
                    let stored = crypto::cipher::value_from_parts(ciphertext.clone(), nonce)
                        .map_err(|_| CryptoError::Decrypt)?;
                    let plaintext = crypto::cipher::decrypt(&stored, &old_dek)
                        .map_err(|_| CryptoError::Decrypt)?;
                    let resealed = crypto::cipher::encrypt(&plaintext, &new_dek)
                        .map_err(|_| CryptoError::Decrypt)?;
                    fields.push((column.clone(), resealed.ciphertext, resealed.nonce.to_vec()));
                }
                updates.push((record.id, fields));
            }

            let applied = {
                let table = table.clone();
                let write_label = write_label.clone();
                self.manager
                    .store()
                    .run(move |conn| {
                        let tx = conn
                            .transaction()
                            .map_err(|e| CryptoError::Storage(e.to_string()))?;
                        for (id, fields) in &updates {
                            records::write_record(&tx, &table, *id, fields, &write_label)
                                .map_err(|e| CryptoError::Storage(e.to_string()))?;
                        }
                        tx.commit()
                            .map_err(|e| CryptoError::Storage(e.to_string()))?;
                        Ok(updates.len())
                    })
                    .await?
            };

            budget -= applied;
            migrated += applied as u64;
        }

        let remaining = self
            .manager
            .store()
            .count_unmigrated(&self.registry, &write_label)
            .await?;

        info!(migrated, remaining, "rotation batch complete");
        Ok(RunReport { migrated, remaining })
    }

    /// Promote the rotating key to active once every record is migrated.
    ///
    /// # Errors
    ///
    /// [`CryptoError::RotationIncomplete`] while records remain (run more
    /// batches); [`CryptoError::NoRotationInProgress`] without an open
    /// rotation.
    pub async fn finalize(&self) -> Result<(EncryptionKey, KeyLabel), CryptoError> {
        let (promoted, retired) = self
            .manager
            .store()
            .promote_rotating_to_active(&self.registry)
            .await?;
        info!(retired = %retired, "rotation finalized; rotating key promoted to active");
        Ok((promoted, retired))
    }
}
