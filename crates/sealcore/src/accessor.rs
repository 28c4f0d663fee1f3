//! Per-record field accessor: transparent encrypt-on-write and
//! decrypt-on-read for business-logic collaborators.
//!
//! All sensitive fields of one record share a single `enc_label` (one DEK
//! per record). A write therefore stamps the current write label onto the
//! row; when the row was previously encrypted under a different label, its
//! other sensitive fields are re-encrypted in the same update so the shared
//! label stays truthful for every field.

use std::sync::Arc;

use common::CryptoError;

use crate::crypto;
use crate::manager::KeyManager;
use crate::records::{EncryptedTable, TableRegistry};

/// Transparent get/set wrapper over encrypted columns.
pub struct FieldAccessor {
    manager: Arc<KeyManager>,
    registry: TableRegistry,
}

impl FieldAccessor {
    /// Build an accessor over the registered tables.
    pub fn new(manager: Arc<KeyManager>, registry: TableRegistry) -> Self {
        Self { manager, registry }
    }

    fn table(&self, table: &str) -> Result<&EncryptedTable, CryptoError> {
        self.registry
            .get(table)
            .ok_or_else(|| CryptoError::InvalidRequest(format!("unregistered table {table:?}")))
    }

    /// Encrypt `plaintext` into `column` of the given record.
    ///
    /// Encrypts under the current write label and updates the record's
    /// `enc_label`; sibling fields encrypted under an older label are
    /// re-encrypted in the same update.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidRequest`] for an unregistered table/column or a
    /// missing record; [`CryptoError::Decrypt`] if a sibling field fails
    /// authentication during re-encryption.
    pub async fn write_field(
        &self,
        table: &str,
        id: i64,
        column: &str,
        plaintext: &[u8],
    ) -> Result<(), CryptoError> {
        let spec = self.table(table)?.clone();
        if !spec.columns.iter().any(|c| c == column) {
            return Err(CryptoError::InvalidRequest(format!(
                "column {column:?} is not a sensitive column of {table:?}"
            )));
        }

        let snapshot = {
            let spec = spec.clone();
            self.manager
                .store()
                .run(move |conn| {
                    crate::records::read_record(conn, &spec, id)
                        .map_err(|e| CryptoError::Storage(e.to_string()))
                })
                .await?
                .ok_or_else(|| {
                    CryptoError::InvalidRequest(format!("no record {id} in {table:?}"))
                })?
        };

        let (value, write_label) = self.manager.encrypt_field(plaintext).await?;
        let mut fields = vec![(column.to_owned(), value.ciphertext, value.nonce.to_vec())];

        // Re-encrypt siblings when the record's label is about to change.
        if !snapshot.enc_label.is_empty() && snapshot.enc_label != write_label {
            for (name, ciphertext, nonce) in &snapshot.fields {
                if name == column {
                    continue;
                }
                let (Some(ciphertext), Some(nonce)) = (ciphertext, nonce) else {
                    continue;
                };
                let stored = crypto::cipher::value_from_parts(ciphertext.clone(), nonce)
                    .map_err(|_| CryptoError::Decrypt)?;
                let plaintext = self
                    .manager
                    .decrypt_field(&stored, &snapshot.enc_label)
                    .await?;
                let (resealed, _) = self.manager.encrypt_field(&plaintext).await?;
                fields.push((name.clone(), resealed.ciphertext, resealed.nonce.to_vec()));
            }
        }

        self.manager
            .store()
            .run(move |conn| {
                crate::records::write_record(conn, &spec, id, &fields, &write_label)
                    .map_err(|e| CryptoError::Storage(e.to_string()))
            })
            .await
    }

    /// Decrypt `column` of the given record using the record's own label.
    ///
    /// Returns `None` when the field has never been set.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Decrypt`] on authentication failure, i.e. corrupt data
    /// or a wrong/missing key for the record's label. The error propagates;
    /// callers decide user-facing behaviour.
    pub async fn read_field(
        &self,
        table: &str,
        id: i64,
        column: &str,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let spec = self.table(table)?.clone();
        let snapshot = self
            .manager
            .store()
            .run(move |conn| {
                crate::records::read_record(conn, &spec, id)
                    .map_err(|e| CryptoError::Storage(e.to_string()))
            })
            .await?
            .ok_or_else(|| CryptoError::InvalidRequest(format!("no record {id} in {table:?}")))?;

        let Some((_, Some(ciphertext), Some(nonce))) = snapshot
            .fields
            .iter()
            .find(|(name, _, _)| name == column)
            .map(|(n, c, no)| (n, c.as_ref(), no.as_ref()))
        else {
            return Ok(None);
        };

        if snapshot.enc_label.is_empty() {
            return Err(CryptoError::Decrypt);
        }
        let value = crypto::cipher::value_from_parts(ciphertext.clone(), nonce)
            .map_err(|_| CryptoError::Decrypt)?;
        self.manager
            .decrypt_field(&value, &snapshot.enc_label)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::crypto::DekBytes;
    use crate::store::KeyStore;
    use crate::wrap::env_kek::EnvKekBackend;
    use crate::wrap::{Backends, KeyWrapBackend, WrapScheme};

    const APP_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS profiles (
         id INTEGER PRIMARY KEY,
         tax_id_ciphertext BLOB,
         tax_id_nonce BLOB,
         account_number_ciphertext BLOB,
         account_number_nonce BLOB,
         enc_label TEXT
     );";

    fn registry() -> TableRegistry {
        TableRegistry::new().register(EncryptedTable::new(
            "profiles",
            "id",
            &["tax_id", "account_number"],
        ))
    }

    async fn accessor_fixture() -> (TempDir, Arc<KeyManager>, FieldAccessor) {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path().join("keys.db"), 2).unwrap();
        store.apply_app_schema(APP_SCHEMA).unwrap();
        store
            .run(|conn| {
                conn.execute("INSERT INTO profiles (id) VALUES (1)", [])
                    .map_err(|e| CryptoError::Storage(e.to_string()))
                    .map(|_| ())
            })
            .await
            .unwrap();

        let backends =
            Backends::new(WrapScheme::EnvKek).with_env_kek(Arc::new(EnvKekBackend::new(
                DekBytes::generate(),
            )));
        let wrapped = backends
            .active()
            .unwrap()
            .wrap(&DekBytes::generate())
            .await
            .unwrap();
        store.force_activate(wrapped, &registry()).await.unwrap();

        let manager = Arc::new(KeyManager::new(store, backends));
        let accessor = FieldAccessor::new(manager.clone(), registry());
        (dir, manager, accessor)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_dir, _manager, accessor) = accessor_fixture().await;

        accessor
            .write_field("profiles", 1, "tax_id", b"378-22-4911")
            .await
            .unwrap();
        let read = accessor.read_field("profiles", 1, "tax_id").await.unwrap();
        assert_eq!(read.as_deref(), Some(&b"378-22-4911"[..]));
    }

    #[tokio::test]
    async fn unset_field_reads_as_none() {
        let (_dir, _manager, accessor) = accessor_fixture().await;
        accessor
            .write_field("profiles", 1, "tax_id", b"378-22-4911")
            .await
            .unwrap();
        let read = accessor
            .read_field("profiles", 1, "account_number")
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn unregistered_table_and_column_are_rejected() {
        let (_dir, _manager, accessor) = accessor_fixture().await;
        assert!(matches!(
            accessor.write_field("ledger", 1, "tax_id", b"x").await,
            Err(CryptoError::InvalidRequest(_))
        ));
        assert!(matches!(
            accessor.write_field("profiles", 1, "name", b"x").await,
            Err(CryptoError::InvalidRequest(_))
        ));
        assert!(matches!(
            accessor.write_field("profiles", 42, "tax_id", b"x").await,
            Err(CryptoError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn write_stamps_current_write_label() {
        let (_dir, manager, accessor) = accessor_fixture().await;
        accessor
            .write_field("profiles", 1, "tax_id", b"378-22-4911")
            .await
            .unwrap();

        let label: String = manager
            .store()
            .run(|conn| {
                conn.query_row("SELECT enc_label FROM profiles WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .map_err(|e| CryptoError::Storage(e.to_string()))
            })
            .await
            .unwrap();
        assert_eq!(label, "active");
    }

    #[tokio::test]
    async fn stale_record_write_reencrypts_siblings() {
        let (_dir, manager, accessor) = accessor_fixture().await;
        accessor
            .write_field("profiles", 1, "tax_id", b"378-22-4911")
            .await
            .unwrap();
        accessor
            .write_field("profiles", 1, "account_number", b"DE44-1234")
            .await
            .unwrap();

        // Open a rotation: the write label moves to the rotating key.
        let wrapped = manager
            .backends()
            .active()
            .unwrap()
            .wrap(&DekBytes::generate())
            .await
            .unwrap();
        let rotating = manager.store().insert_rotating(wrapped).await.unwrap();

        // Updating one field moves the whole record to the new label...
        accessor
            .write_field("profiles", 1, "tax_id", b"505-11-0000")
            .await
            .unwrap();
        let label: String = manager
            .store()
            .run(|conn| {
                conn.query_row("SELECT enc_label FROM profiles WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .map_err(|e| CryptoError::Storage(e.to_string()))
            })
            .await
            .unwrap();
        assert_eq!(label, rotating.label.to_string());

        // ...and the untouched sibling still decrypts.
        let sibling = accessor
            .read_field("profiles", 1, "account_number")
            .await
            .unwrap();
        assert_eq!(sibling.as_deref(), Some(&b"DE44-1234"[..]));
        let updated = accessor.read_field("profiles", 1, "tax_id").await.unwrap();
        assert_eq!(updated.as_deref(), Some(&b"505-11-0000"[..]));
    }
}
