//! HTTP server: operator commands and the health surface.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
