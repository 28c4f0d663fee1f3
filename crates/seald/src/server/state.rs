//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Duration;

use sealcore::wrap::kms::KmsClient;
use sealcore::{HealthReporter, KeyManager, RewrapManager, RotationOrchestrator, TableRegistry};

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable (`Arc`-wrapped or plain data) so that
/// Axum can clone the state for each request.
#[derive(Clone)]
pub struct AppState {
    /// Label resolution, DEK cache, and field crypto.
    pub manager: Arc<KeyManager>,
    /// The begin/run/finalize rotation workflow.
    pub rotation: Arc<RotationOrchestrator>,
    /// In-place wrap mutations on the active key.
    pub rewrap: Arc<RewrapManager>,
    /// Readiness and gauges.
    pub health: Arc<HealthReporter>,
    /// Tables checked by `force-new-dek` for existing encrypted records.
    pub registry: TableRegistry,
    /// KMS client used to build rewrap targets on demand.
    pub kms_client: Arc<dyn KmsClient>,
    /// Per-attempt timeout for KMS calls.
    pub kms_timeout: Duration,
    /// Retry budget for transient KMS failures.
    pub kms_max_retries: u32,
    /// Batch size used when `rotate/run` does not specify one.
    pub default_batch_size: usize,
}
