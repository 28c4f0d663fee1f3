//! `seald` — ledgerseal service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Open the key store and apply the application schema.
//! 4. Build the wrap backends selected by `WRAP_SCHEME`.
//! 5. Probe the active DEK once to seed readiness (failure is logged, not
//!    fatal — the readiness endpoint stays 503 until resolved).
//! 6. Build the Axum router and start the HTTP server.

mod config;
mod server;
mod tables;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::CryptoError;
use sealcore::wrap::env_kek::EnvKekBackend;
use sealcore::wrap::kms::{AwsKmsClient, KmsBackend, KmsClient};
use sealcore::{
    Backends, HealthReporter, KeyManager, KeyStore, RewrapManager, RotationOrchestrator,
};

use config::Config;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        wrap_scheme = %cfg.wrap_scheme,
        "seald starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key store
    // -----------------------------------------------------------------------
    let store = KeyStore::open(&cfg.db_path, cfg.pool_size)
        .map_err(|e| anyhow::anyhow!("failed to open key store: {e}"))?;
    store
        .apply_app_schema(tables::APP_SCHEMA)
        .map_err(|e| anyhow::anyhow!("failed to apply application schema: {e}"))?;

    // -----------------------------------------------------------------------
    // 4. Wrap backends
    // -----------------------------------------------------------------------
    let scheme = cfg.scheme()?;
    let kms_client: Arc<dyn KmsClient> = Arc::new(AwsKmsClient::init().await);
    let kms_timeout = Duration::from_secs(cfg.kms_timeout_secs);

    let mut backends = Backends::new(scheme);
    if let Some(encoded) = cfg.kek_base64.as_deref() {
        let env_backend = EnvKekBackend::from_base64(encoded)
            .map_err(|e| anyhow::anyhow!("invalid KEK_BASE64: {e}"))?;
        backends = backends.with_env_kek(Arc::new(env_backend));
    }
    if let Some(key_id) = cfg.kms_key_id.as_deref() {
        let kms_backend = KmsBackend::new(kms_client.clone(), key_id)
            .with_timeout(kms_timeout)
            .with_max_retries(cfg.kms_max_retries);
        backends = backends.with_kms(Arc::new(kms_backend));
    }

    let manager = Arc::new(KeyManager::new(store, backends));
    let registry = tables::encrypted_tables();

    // -----------------------------------------------------------------------
    // 5. Startup probe
    // -----------------------------------------------------------------------
    match manager.resolve_write_dek().await {
        Ok((_, label)) => info!(%label, "active DEK unwrapped; crypto ready"),
        Err(CryptoError::KeyNotFound(_)) => {
            info!("no active key yet; bootstrap with POST /crypto/force-new-dek")
        }
        Err(e) => warn!(error = %e, "active DEK not resolvable at startup; readiness stays down"),
    }

    // -----------------------------------------------------------------------
    // 6. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState {
        rotation: Arc::new(RotationOrchestrator::new(manager.clone(), registry.clone())),
        rewrap: Arc::new(RewrapManager::new(manager.clone())),
        health: Arc::new(HealthReporter::new(manager.clone())),
        manager,
        registry,
        kms_client,
        kms_timeout,
        kms_max_retries: cfg.kms_max_retries,
        default_batch_size: cfg.rotate_batch_size,
    };
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listen port")?;
    axum::serve(listener, router).await?;

    Ok(())
}
