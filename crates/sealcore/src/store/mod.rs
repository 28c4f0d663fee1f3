//! Durable store for wrapped DEK rows and the write-label settings row.
//!
//! One row per key generation. The subsystem never deletes a row: label
//! transitions (`rotating → active`, `active → retired::<ts>`) are the only
//! lifecycle mutations, and the multi-row transitions happen inside a single
//! transaction so the exactly-one-active invariant holds at every observable
//! point.
//!
//! Backed by SQLite through an `r2d2` connection pool; all public methods
//! move the blocking work onto the Tokio blocking pool.

pub mod label;

pub use label::KeyLabel;

use std::path::Path;

use common::CryptoError;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::records::{self, TableRegistry};
use crate::wrap::{WrapScheme, WrappedDek};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// One stored key generation.
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    /// Opaque unique identifier; stable across relabelling.
    pub id: String,
    /// Current label of this generation.
    pub label: KeyLabel,
    /// The wrapped DEK and how it is wrapped.
    pub wrapped: WrappedDek,
    /// Creation time, unix seconds.
    pub created_at: i64,
}

/// Handle to the key tables. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct KeyStore {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl KeyStore {
    /// Open (or create) the database at `path` and ensure the subsystem
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Storage`] if the pool cannot be built or the
    /// schema cannot be applied.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, CryptoError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(storage_err)?;

        let store = Self { pool };
        let conn = store.conn()?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage_err)?;

        info!(
            db_path = %path.as_ref().display(),
            pool_size = pool_size.max(1),
            "key store opened"
        );
        Ok(store)
    }

    /// Apply the owning application's table schema (encrypted-field columns
    /// live in app tables, not in the subsystem's own).
    pub fn apply_app_schema(&self, sql: &str) -> Result<(), CryptoError> {
        self.conn()?.execute_batch(sql).map_err(storage_err)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CryptoError> {
        self.pool.get().map_err(storage_err)
    }

    /// Run `f` with a pooled connection on the blocking pool.
    ///
    /// Also the owning application's hook for reading and writing its own
    /// tables over the shared pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T, CryptoError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CryptoError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(storage_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CryptoError::Storage(format!("blocking task failed: {e}")))?
    }

    /// Fetch a key row by its current label string.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if no row carries `label`.
    pub async fn get_by_label(&self, label: &str) -> Result<EncryptionKey, CryptoError> {
        let label = label.to_owned();
        self.run(move |conn| {
            query_by_label(conn, &label)?.ok_or(CryptoError::KeyNotFound(label))
        })
        .await
    }

    /// Fetch the single active key row.
    pub async fn get_active(&self) -> Result<EncryptionKey, CryptoError> {
        self.get_by_label("active").await
    }

    /// Fetch the rotating key row, if a rotation is open.
    pub async fn rotating(&self) -> Result<Option<EncryptionKey>, CryptoError> {
        self.run(|conn| query_rotating(conn)).await
    }

    /// Current write label, or `None` before first bootstrap.
    pub async fn write_label(&self) -> Result<Option<String>, CryptoError> {
        self.run(|conn| {
            conn.query_row(
                "SELECT write_label FROM encryption_settings WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    /// Total number of key rows.
    pub async fn count_keys(&self) -> Result<u64, CryptoError> {
        self.run(|conn| {
            conn.query_row("SELECT COUNT(*) FROM encryption_keys", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(storage_err)
        })
        .await
    }

    /// Count rows with encrypted data across all registered tables.
    pub async fn count_encrypted_records(
        &self,
        registry: &TableRegistry,
    ) -> Result<u64, CryptoError> {
        let registry = registry.clone();
        self.run(move |conn| records::count_encrypted(conn, &registry).map_err(storage_err))
            .await
    }

    /// Count rows still encrypted under a label other than `write_label`.
    pub async fn count_unmigrated(
        &self,
        registry: &TableRegistry,
        write_label: &str,
    ) -> Result<u64, CryptoError> {
        let registry = registry.clone();
        let write_label = write_label.to_owned();
        self.run(move |conn| {
            records::count_unmigrated(conn, &registry, &write_label).map_err(storage_err)
        })
        .await
    }

    /// Activate a brand-new wrapped DEK, bypassing rotation.
    ///
    /// Refused while any encrypted record exists, since replacing the active
    /// key under live data would orphan every record. Any existing active row is
    /// relabelled retired (wrong key material kept for forensics), the new
    /// row becomes `active`, and `write_label` is repointed, all in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`CryptoError::EncryptedRecordsExist`] when records exist;
    /// [`CryptoError::RotationAlreadyInProgress`] while a rotation is open.
    pub async fn force_activate(
        &self,
        wrapped: WrappedDek,
        registry: &TableRegistry,
    ) -> Result<EncryptionKey, CryptoError> {
        let registry = registry.clone();
        let now = chrono::Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            let encrypted = records::count_encrypted(&tx, &registry).map_err(storage_err)?;
            if encrypted > 0 {
                return Err(CryptoError::EncryptedRecordsExist(encrypted));
            }
            if query_rotating(&tx)?.is_some() {
                return Err(CryptoError::RotationAlreadyInProgress);
            }

            if query_by_label(&tx, "active")?.is_some() {
                let retired = unique_retired_label(&tx, now)?;
                tx.execute(
                    "UPDATE encryption_keys SET label = ?1 WHERE label = 'active'",
                    params![retired.to_string()],
                )
                .map_err(storage_err)?;
            }

            let key = insert_key(&tx, &id, &KeyLabel::Active, &wrapped, now)?;
            set_write_label(&tx, "active")?;

            tx.commit().map_err(storage_err)?;
            Ok(key)
        })
        .await
    }

    /// Insert a fresh rotating key and repoint `write_label` at it.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if no active key exists to rotate away
    /// from; [`CryptoError::RotationAlreadyInProgress`] if a rotating row
    /// already exists.
    pub async fn insert_rotating(&self, wrapped: WrappedDek) -> Result<EncryptionKey, CryptoError> {
        let now = chrono::Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            if query_by_label(&tx, "active")?.is_none() {
                return Err(CryptoError::KeyNotFound("active".into()));
            }
            if query_rotating(&tx)?.is_some() {
                return Err(CryptoError::RotationAlreadyInProgress);
            }

            let label = KeyLabel::Rotating(now);
            let key = insert_key(&tx, &id, &label, &wrapped, now)?;
            set_write_label(&tx, &label.to_string())?;

            tx.commit().map_err(storage_err)?;
            Ok(key)
        })
        .await
    }

    /// Promote the rotating key to active and retire the previous active key.
    ///
    /// The whole transition is one transaction: re-verify that no record
    /// remains under a previous label, relabel the two key rows, rewrite
    /// record labels from the rotating label to `active`, and repoint
    /// `write_label`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::NoRotationInProgress`] without a rotating row;
    /// [`CryptoError::RotationIncomplete`] while un-migrated records remain.
    pub async fn promote_rotating_to_active(
        &self,
        registry: &TableRegistry,
    ) -> Result<(EncryptionKey, KeyLabel), CryptoError> {
        let registry = registry.clone();
        let now = chrono::Utc::now().timestamp();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            let rotating = query_rotating(&tx)?.ok_or(CryptoError::NoRotationInProgress)?;
            let rotating_label = rotating.label.to_string();

            let remaining =
                records::count_unmigrated(&tx, &registry, &rotating_label).map_err(storage_err)?;
            if remaining > 0 {
                return Err(CryptoError::RotationIncomplete { remaining });
            }

            let retired = unique_retired_label(&tx, now)?;
            let relabelled = tx
                .execute(
                    "UPDATE encryption_keys SET label = ?1 WHERE label = 'active'",
                    params![retired.to_string()],
                )
                .map_err(storage_err)?;
            if relabelled != 1 {
                return Err(CryptoError::KeyNotFound("active".into()));
            }
            tx.execute(
                "UPDATE encryption_keys SET label = 'active' WHERE id = ?1",
                params![rotating.id],
            )
            .map_err(storage_err)?;

            records::relabel_records(&tx, &registry, &rotating_label, "active")
                .map_err(storage_err)?;
            set_write_label(&tx, "active")?;

            tx.commit().map_err(storage_err)?;

            let promoted = EncryptionKey {
                label: KeyLabel::Active,
                ..rotating
            };
            Ok((promoted, retired))
        })
        .await
    }

    /// Replace the wrap fields of the row carrying `label`, in place.
    ///
    /// Used by rewrap only; neither the label nor any record changes.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if no row carries `label`.
    pub async fn update_wrap_fields(
        &self,
        label: &str,
        wrapped: WrappedDek,
    ) -> Result<(), CryptoError> {
        let label = label.to_owned();
        self.run(move |conn| {
            let nonce: Option<&[u8]> = if wrapped.nonce.is_empty() {
                None
            } else {
                Some(&wrapped.nonce)
            };
            let changed = conn
                .execute(
                    "UPDATE encryption_keys
                     SET dek_wrapped = ?1, dek_wrap_nonce = ?2, wrap_scheme = ?3, kms_key_id = ?4
                     WHERE label = ?5",
                    params![
                        wrapped.ciphertext,
                        nonce,
                        wrapped.scheme.as_str(),
                        wrapped.kms_key_id,
                        label
                    ],
                )
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(CryptoError::KeyNotFound(label));
            }
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by the transactional methods above)
// ---------------------------------------------------------------------------

const KEY_COLUMNS: &str =
    "id, label, dek_wrapped, dek_wrap_nonce, wrap_scheme, kms_key_id, created_at";

fn storage_err(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::Storage(e.to_string())
}

fn read_key_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, Vec<u8>, Option<Vec<u8>>, String, Option<String>, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn key_from_parts(
    parts: (String, String, Vec<u8>, Option<Vec<u8>>, String, Option<String>, i64),
) -> Result<EncryptionKey, CryptoError> {
    let (id, label, ciphertext, nonce, scheme, kms_key_id, created_at) = parts;
    Ok(EncryptionKey {
        id,
        label: KeyLabel::parse(&label)?,
        wrapped: WrappedDek {
            ciphertext,
            nonce: nonce.unwrap_or_default(),
            scheme: WrapScheme::parse(&scheme)?,
            kms_key_id,
        },
        created_at,
    })
}

fn query_by_label(conn: &Connection, label: &str) -> Result<Option<EncryptionKey>, CryptoError> {
    let parts = conn
        .query_row(
            &format!("SELECT {KEY_COLUMNS} FROM encryption_keys WHERE label = ?1"),
            params![label],
            read_key_row,
        )
        .optional()
        .map_err(storage_err)?;
    parts.map(key_from_parts).transpose()
}

fn query_rotating(conn: &Connection) -> Result<Option<EncryptionKey>, CryptoError> {
    let parts = conn
        .query_row(
            &format!(
                "SELECT {KEY_COLUMNS} FROM encryption_keys WHERE label LIKE 'rotating::%' LIMIT 1"
            ),
            [],
            read_key_row,
        )
        .optional()
        .map_err(storage_err)?;
    parts.map(key_from_parts).transpose()
}

fn insert_key(
    conn: &Connection,
    id: &str,
    label: &KeyLabel,
    wrapped: &WrappedDek,
    created_at: i64,
) -> Result<EncryptionKey, CryptoError> {
    let nonce: Option<&[u8]> = if wrapped.nonce.is_empty() {
        None
    } else {
        Some(&wrapped.nonce)
    };
    conn.execute(
        "INSERT INTO encryption_keys (id, label, dek_wrapped, dek_wrap_nonce, wrap_scheme, kms_key_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            label.to_string(),
            wrapped.ciphertext,
            nonce,
            wrapped.scheme.as_str(),
            wrapped.kms_key_id,
            created_at
        ],
    )
    .map_err(storage_err)?;
    Ok(EncryptionKey {
        id: id.to_owned(),
        label: label.clone(),
        wrapped: wrapped.clone(),
        created_at,
    })
}

fn set_write_label(conn: &Connection, label: &str) -> Result<(), CryptoError> {
    conn.execute(
        "INSERT INTO encryption_settings (id, write_label) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET write_label = excluded.write_label",
        params![label],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Pick a `retired::<ts>` label not already taken (two promotions within one
/// second would otherwise collide on the UNIQUE label constraint).
fn unique_retired_label(conn: &Connection, base_ts: i64) -> Result<KeyLabel, CryptoError> {
    let mut ts = base_ts;
    loop {
        let candidate = KeyLabel::Retired(ts);
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM encryption_keys WHERE label = ?1)",
                params![candidate.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        if !exists {
            return Ok(candidate);
        }
        ts += 1;
    }
}
