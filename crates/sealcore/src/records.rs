//! Registry of owning-application tables that carry encrypted fields, plus
//! the record-level SQL used by the accessor and the rotation orchestrator.
//!
//! Each sensitive logical column `c` of a registered table is stored as two
//! physical columns `c_ciphertext BLOB` and `c_nonce BLOB`; every row also
//! carries one shared `enc_label TEXT` column naming the key generation that
//! encrypted **all** of that row's sensitive fields. `enc_label` is NULL
//! until the first sensitive value is written.
//!
//! Table and column names come from compile-time registration by the owning
//! application, never from request input, so they are interpolated into SQL
//! directly.

use rusqlite::{params, Connection, OptionalExtension};

/// Name of the shared per-row label column.
pub const ENC_LABEL_COLUMN: &str = "enc_label";

/// One owning-application table with encrypted fields.
#[derive(Debug, Clone)]
pub struct EncryptedTable {
    /// SQL table name.
    pub table: String,
    /// Integer primary-key column.
    pub id_column: String,
    /// Logical names of the sensitive columns.
    pub columns: Vec<String>,
}

impl EncryptedTable {
    /// Describe a table with its sensitive logical columns.
    pub fn new(table: impl Into<String>, id_column: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            id_column: id_column.into(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
        }
    }

    /// Physical ciphertext column for a logical column.
    pub fn ciphertext_column(column: &str) -> String {
        format!("{column}_ciphertext")
    }

    /// Physical nonce column for a logical column.
    pub fn nonce_column(column: &str) -> String {
        format!("{column}_nonce")
    }
}

/// All tables the subsystem migrates during rotation.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: Vec<EncryptedTable>,
}

impl TableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table description.
    pub fn register(mut self, table: EncryptedTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Iterate the registered tables.
    pub fn iter(&self) -> impl Iterator<Item = &EncryptedTable> {
        self.tables.iter()
    }

    /// Look up a table description by name.
    pub fn get(&self, table: &str) -> Option<&EncryptedTable> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Snapshot of one record's encrypted fields, as read before re-encryption.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    /// Primary-key value.
    pub id: i64,
    /// Label currently recorded on the row.
    pub enc_label: String,
    /// `(logical column, ciphertext, nonce)`; `None` for fields never set.
    pub fields: Vec<(String, Option<Vec<u8>>, Option<Vec<u8>>)>,
}

/// Count rows with any encrypted data across all registered tables.
pub(crate) fn count_encrypted(
    conn: &Connection,
    registry: &TableRegistry,
) -> rusqlite::Result<u64> {
    let mut total = 0u64;
    for t in registry.iter() {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {ENC_LABEL_COLUMN} IS NOT NULL",
            t.table
        );
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        total += n as u64;
    }
    Ok(total)
}

/// Count rows still encrypted under a label other than `write_label`.
pub(crate) fn count_unmigrated(
    conn: &Connection,
    registry: &TableRegistry,
    write_label: &str,
) -> rusqlite::Result<u64> {
    let mut total = 0u64;
    for t in registry.iter() {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {ENC_LABEL_COLUMN} IS NOT NULL AND {ENC_LABEL_COLUMN} != ?1",
            t.table
        );
        let n: i64 = conn.query_row(&sql, params![write_label], |row| row.get(0))?;
        total += n as u64;
    }
    Ok(total)
}

/// Select up to `limit` un-migrated records from one table, with all their
/// encrypted fields.
pub(crate) fn select_unmigrated(
    conn: &Connection,
    table: &EncryptedTable,
    write_label: &str,
    limit: usize,
) -> rusqlite::Result<Vec<RecordSnapshot>> {
    let mut select_cols = vec![table.id_column.clone(), ENC_LABEL_COLUMN.to_owned()];
    for c in &table.columns {
        select_cols.push(EncryptedTable::ciphertext_column(c));
        select_cols.push(EncryptedTable::nonce_column(c));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {ENC_LABEL_COLUMN} IS NOT NULL AND {ENC_LABEL_COLUMN} != ?1 \
         ORDER BY {} LIMIT ?2",
        select_cols.join(", "),
        table.table,
        table.id_column,
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![write_label, limit as i64], |row| {
        let id: i64 = row.get(0)?;
        let enc_label: String = row.get(1)?;
        let mut fields = Vec::with_capacity(table.columns.len());
        for (i, c) in table.columns.iter().enumerate() {
            let ciphertext: Option<Vec<u8>> = row.get(2 + i * 2)?;
            let nonce: Option<Vec<u8>> = row.get(3 + i * 2)?;
            fields.push((c.clone(), ciphertext, nonce));
        }
        Ok(RecordSnapshot {
            id,
            enc_label,
            fields,
        })
    })?;
    rows.collect()
}

/// Read one record's encrypted fields and label. `None` if the row is absent.
pub(crate) fn read_record(
    conn: &Connection,
    table: &EncryptedTable,
    id: i64,
) -> rusqlite::Result<Option<RecordSnapshot>> {
    let mut select_cols = vec![ENC_LABEL_COLUMN.to_owned()];
    for c in &table.columns {
        select_cols.push(EncryptedTable::ciphertext_column(c));
        select_cols.push(EncryptedTable::nonce_column(c));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_cols.join(", "),
        table.table,
        table.id_column,
    );

    conn.query_row(&sql, params![id], |row| {
        let enc_label: Option<String> = row.get(0)?;
        let mut fields = Vec::with_capacity(table.columns.len());
        for (i, c) in table.columns.iter().enumerate() {
            let ciphertext: Option<Vec<u8>> = row.get(1 + i * 2)?;
            let nonce: Option<Vec<u8>> = row.get(2 + i * 2)?;
            fields.push((c.clone(), ciphertext, nonce));
        }
        Ok(RecordSnapshot {
            id,
            enc_label: enc_label.unwrap_or_default(),
            fields,
        })
    })
    .optional()
}

/// Write re-encrypted fields and the new label onto one record.
///
/// `fields` holds `(logical column, ciphertext, nonce)` for every field that
/// has a value; fields absent from the slice are left untouched (they were
/// NULL and stay NULL).
pub(crate) fn write_record(
    conn: &Connection,
    table: &EncryptedTable,
    id: i64,
    fields: &[(String, Vec<u8>, Vec<u8>)],
    enc_label: &str,
) -> rusqlite::Result<()> {
    let mut assignments = vec![format!("{ENC_LABEL_COLUMN} = ?1")];
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(enc_label.to_owned())];
    let mut next = 2;
    for (column, ciphertext, nonce) in fields {
        assignments.push(format!(
            "{} = ?{next}, {} = ?{}",
            EncryptedTable::ciphertext_column(column),
            EncryptedTable::nonce_column(column),
            next + 1,
        ));
        values.push(Box::new(ciphertext.clone()));
        values.push(Box::new(nonce.clone()));
        next += 2;
    }
    values.push(Box::new(id));
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{next}",
        table.table,
        assignments.join(", "),
        table.id_column,
    );
    conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
    Ok(())
}

/// Relabel every record carrying `from` to `to`, without touching ciphertext.
pub(crate) fn relabel_records(
    conn: &Connection,
    registry: &TableRegistry,
    from: &str,
    to: &str,
) -> rusqlite::Result<()> {
    for t in registry.iter() {
        let sql = format!(
            "UPDATE {} SET {ENC_LABEL_COLUMN} = ?1 WHERE {ENC_LABEL_COLUMN} = ?2",
            t.table
        );
        conn.execute(&sql, params![to, from])?;
    }
    Ok(())
}
