//! Encrypted-table registrations for the ledger application.
//!
//! Must stay in lockstep with `schema.sql`: every table listed here carries
//! the `<column>_ciphertext` / `<column>_nonce` pairs and the shared
//! `enc_label` column.

use sealcore::{EncryptedTable, TableRegistry};

/// Application schema applied next to the subsystem's own tables.
pub const APP_SCHEMA: &str = include_str!("schema.sql");

/// The tables whose fields are encrypted and migrated during rotation.
pub fn encrypted_tables() -> TableRegistry {
    TableRegistry::new()
        .register(EncryptedTable::new(
            "bank_connections",
            "id",
            &["access_token", "refresh_token"],
        ))
        .register(EncryptedTable::new(
            "customer_profiles",
            "id",
            &["tax_id", "account_number"],
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_schema() {
        let registry = encrypted_tables();
        let bank = registry.get("bank_connections").unwrap();
        assert_eq!(bank.columns, vec!["access_token", "refresh_token"]);
        let profiles = registry.get("customer_profiles").unwrap();
        assert_eq!(profiles.id_column, "id");
        assert!(registry.get("transactions").is_none());
    }
}
