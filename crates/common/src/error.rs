//! Crypto-layer error taxonomy shared across crates.

use thiserror::Error;

/// Errors produced by the key-management subsystem.
///
/// Variants map to HTTP status codes on the operator command surface:
/// - user errors (bad input, wrong state) → 400/409
/// - backend outages → 503
/// - key material and data failures → 500
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Unwrapping the DEK failed authentication: wrong key material or a
    /// tampered wrapped key. Not auto-recoverable; readiness stays down
    /// until the operator restores the correct KEK or KMS key.
    #[error("DEK unwrap failed authentication: wrong key material or tampered ciphertext")]
    UnwrapAuth,

    /// The wrap backend could not be reached (network or service outage).
    /// Transient; retried with backoff before this surfaces.
    #[error("key wrap backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A field value failed authenticated decryption. Either the stored
    /// ciphertext is corrupt or the record's label points at the wrong key.
    #[error("field decryption failed: corrupt ciphertext or wrong key for this record")]
    Decrypt,

    /// Finalize was called while records remain un-migrated. Run more
    /// rotation batches; this is not an alarm condition.
    #[error("rotation incomplete: {remaining} records still encrypted under a previous key")]
    RotationIncomplete { remaining: u64 },

    /// Begin was called while a rotating key already exists.
    #[error("a rotation is already in progress")]
    RotationAlreadyInProgress,

    /// Run or Finalize was called with no rotating key present.
    #[error("no rotation in progress")]
    NoRotationInProgress,

    /// No key row carries the requested label.
    #[error("no encryption key with label {0:?}")]
    KeyNotFound(String),

    /// A stored label does not match any of the three recognised shapes.
    #[error("malformed key label {0:?}")]
    InvalidLabel(String),

    /// `force-new-active-dek` was refused because encrypted records exist;
    /// replacing the DEK now would make them permanently unreadable.
    #[error("{0} encrypted records exist; forcing a new DEK would orphan them")]
    EncryptedRecordsExist(u64),

    /// Key material has the wrong length (DEK and KEK are 32 bytes).
    #[error("invalid key length: expected 32 bytes")]
    InvalidKeyLength,

    /// The request itself was malformed (missing or conflicting parameters).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The key store could not be read or written.
    #[error("key store error: {0}")]
    Storage(String),
}

impl CryptoError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            CryptoError::InvalidRequest(_) | CryptoError::InvalidKeyLength => 400,
            CryptoError::KeyNotFound(_) => 404,
            CryptoError::RotationIncomplete { .. }
            | CryptoError::RotationAlreadyInProgress
            | CryptoError::NoRotationInProgress
            | CryptoError::EncryptedRecordsExist(_) => 409,
            CryptoError::BackendUnavailable(_) => 503,
            CryptoError::UnwrapAuth
            | CryptoError::Decrypt
            | CryptoError::InvalidLabel(_)
            | CryptoError::Storage(_) => 500,
        }
    }

    /// Short machine-readable code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::UnwrapAuth => "unwrap_auth_failed",
            CryptoError::BackendUnavailable(_) => "backend_unavailable",
            CryptoError::Decrypt => "decrypt_failed",
            CryptoError::RotationIncomplete { .. } => "rotation_incomplete",
            CryptoError::RotationAlreadyInProgress => "rotation_already_in_progress",
            CryptoError::NoRotationInProgress => "no_rotation_in_progress",
            CryptoError::KeyNotFound(_) => "key_not_found",
            CryptoError::InvalidLabel(_) => "invalid_label",
            CryptoError::EncryptedRecordsExist(_) => "encrypted_records_exist",
            CryptoError::InvalidKeyLength => "invalid_key_length",
            CryptoError::InvalidRequest(_) => "bad_request",
            CryptoError::Storage(_) => "storage_error",
        }
    }
}
