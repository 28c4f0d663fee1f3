//! `sealcore` — envelope-encryption key management for field-level data.
//!
//! The library owns the full DEK lifecycle: generation, wrapping under an
//! operator KEK or an external KMS, durable storage of wrapped keys, lazy
//! unwrap-and-cache resolution, per-record field encryption, multi-phase
//! resumable rotation, and in-place rewrap.
//!
//! Layering, leaves first:
//!
//! 1. [`crypto`] — AES-256-GCM primitives, no persistent state.
//! 2. [`wrap`] — interchangeable DEK wrap backends (env KEK, KMS).
//! 3. [`store`] — durable wrapped-key table plus the write-label settings row.
//! 4. [`manager`] — label resolution, plaintext DEK cache, encrypt/decrypt.
//! 5. [`accessor`] — per-record get/set wrapper used by business code.
//! 6. [`rotation`] / [`rewrap`] — key lifecycle workflows.
//! 7. [`health`] — readiness and operational gauges.

pub mod accessor;
pub mod crypto;
pub mod health;
pub mod manager;
pub mod records;
pub mod rewrap;
pub mod rotation;
pub mod store;
pub mod wrap;

pub use accessor::FieldAccessor;
pub use crypto::{DekBytes, EncryptedValue};
pub use health::HealthReporter;
pub use manager::{KeyManager, ReadyState};
pub use records::{EncryptedTable, TableRegistry};
pub use rewrap::RewrapManager;
pub use rotation::RotationOrchestrator;
pub use store::{KeyLabel, KeyStore};
pub use wrap::{Backends, WrapScheme, WrappedDek};
