//! Middleware constants applied to the router.

use std::time::Duration;

/// Default per-request timeout applied to all routes. Rotation batches are
/// sized so a single `rotate/run` invocation fits comfortably inside it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
