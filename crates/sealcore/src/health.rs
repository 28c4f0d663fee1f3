//! Readiness and operational gauges for the surrounding service.
//!
//! Four gauges, rendered in plain-text exposition format (metric name,
//! optional labels, numeric value, one per line) for the info endpoint.
//! Readiness follows the key manager's state: not-ready until the first
//! successful write-DEK resolution, permanently not-ready after an
//! authentication failure.

use std::sync::Arc;

use common::protocol::CryptoStatusResponse;
use common::CryptoError;

use crate::manager::KeyManager;
use crate::wrap::WrapScheme;

/// Snapshot of the operational gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoGauges {
    /// Active DEK successfully unwrapped at least once this process.
    pub ready: bool,
    /// Wrap scheme of the active key; `None` before bootstrap.
    pub mode: Option<WrapScheme>,
    /// Number of rows in the key store.
    pub keys_total: u64,
    /// Seconds since the active key was created; `None` before bootstrap.
    pub active_label_age_seconds: Option<i64>,
}

/// Computes gauges and operator status from durable and in-process state.
pub struct HealthReporter {
    manager: Arc<KeyManager>,
}

impl HealthReporter {
    /// Build a reporter over the key manager.
    pub fn new(manager: Arc<KeyManager>) -> Self {
        Self { manager }
    }

    /// `true` once the active DEK has been unwrapped this process.
    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    /// Compute the current gauge snapshot.
    pub async fn gauges(&self) -> Result<CryptoGauges, CryptoError> {
        let keys_total = self.manager.store().count_keys().await?;
        let (mode, age) = match self.manager.store().get_active().await {
            Ok(active) => {
                let age = (chrono::Utc::now().timestamp() - active.created_at).max(0);
                (Some(active.wrapped.scheme), Some(age))
            }
            Err(CryptoError::KeyNotFound(_)) => (None, None),
            Err(e) => return Err(e),
        };
        Ok(CryptoGauges {
            ready: self.manager.is_ready(),
            mode,
            keys_total,
            active_label_age_seconds: age,
        })
    }

    /// Assemble the operator-facing status body.
    pub async fn status(&self) -> Result<CryptoStatusResponse, CryptoError> {
        match self.manager.store().get_active().await {
            Ok(active) => Ok(CryptoStatusResponse {
                mode: Some(active.wrapped.scheme.to_string()),
                label: Some(active.label.to_string()),
                kms_key_id: active.wrapped.kms_key_id,
                ready: self.manager.is_ready(),
            }),
            Err(CryptoError::KeyNotFound(_)) => Ok(CryptoStatusResponse {
                mode: None,
                label: None,
                kms_key_id: None,
                ready: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Render gauges in plain-text exposition format.
    pub fn render(gauges: &CryptoGauges) -> String {
        let mut out = String::new();
        out.push_str(&format!("crypto_ready {}\n", u8::from(gauges.ready)));
        if let Some(mode) = gauges.mode {
            out.push_str(&format!("crypto_mode{{mode=\"{mode}\"}} 1\n"));
        }
        out.push_str(&format!("crypto_keys_total {}\n", gauges.keys_total));
        if let Some(age) = gauges.active_label_age_seconds {
            out.push_str(&format!("crypto_active_label_age_seconds {age}\n"));
        }
        out
    }
}
