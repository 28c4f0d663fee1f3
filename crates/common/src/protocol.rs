//! Request and response types for the operator command surface.
//!
//! These types are serialised as JSON by the `seald` HTTP server. Binary
//! values (key material) travel as standard base64 strings.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"rotation_incomplete"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// crypto-status
// ---------------------------------------------------------------------------

/// Response body for `GET /crypto/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoStatusResponse {
    /// Wrap scheme of the active key: `"env_kek"` or `"kms"`. Absent when no
    /// active key exists yet (pre-bootstrap).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Label of the active key row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// KMS key identifier, present only when `mode` is `"kms"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    /// Whether the active DEK has been successfully unwrapped this process.
    pub ready: bool,
}

// ---------------------------------------------------------------------------
// Rotation workflow
// ---------------------------------------------------------------------------

/// Response body for `POST /crypto/rotate/begin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateBeginResponse {
    /// Label of the freshly inserted rotating key; also the new write label.
    pub rotating_label: String,
}

/// Request body for `POST /crypto/rotate/run`. An empty body uses the
/// configured default batch size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotateRunRequest {
    /// Maximum number of records to migrate in this invocation.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Response body for `POST /crypto/rotate/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateRunResponse {
    /// Records re-encrypted by this invocation.
    pub migrated: u64,
    /// Records still encrypted under a previous key after this invocation.
    pub remaining: u64,
}

/// Response body for `POST /crypto/rotate/finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateFinalizeResponse {
    /// Label now carried by the promoted key (always `"active"`).
    pub active_label: String,
    /// Label assigned to the previously active key.
    pub retired_label: String,
}

// ---------------------------------------------------------------------------
// Rewrap and bootstrap
// ---------------------------------------------------------------------------

/// Request body for `POST /crypto/rewrap`. Exactly one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewrapRequest {
    /// Migrate the active DEK's wrapping to this KMS key.
    #[serde(default)]
    pub to_kms: Option<String>,
    /// Re-wrap the active DEK under this replacement KEK (base64, 32 bytes).
    #[serde(default)]
    pub new_kek: Option<String>,
}

/// Response body for `POST /crypto/rewrap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrapResponse {
    /// Wrap scheme of the active key after the operation.
    pub scheme: String,
    /// KMS key identifier, present only after a KMS migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
}

/// Response body for `POST /crypto/force-new-dek`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceNewDekResponse {
    /// Label of the newly activated key (always `"active"`).
    pub label: String,
}
