//! Axum request handlers for the operator commands and health surface.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    ErrorResponse, ForceNewDekResponse, RewrapRequest, RewrapResponse, RotateBeginResponse,
    RotateFinalizeResponse, RotateRunRequest, RotateRunResponse,
};
use common::CryptoError;
use sealcore::wrap::kms::KmsBackend;
use sealcore::{DekBytes, HealthReporter};

use super::state::AppState;

fn error_response(e: &CryptoError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::new(e.code(), e.to_string()))).into_response()
}

/// `GET /health/ready` — readiness probe.
///
/// 200 once the active DEK has been unwrapped this process; 503 before
/// that, and permanently 503 after an unwrap authentication failure.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.health.is_ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "crypto not ready").into_response()
    }
}

/// `GET /health/metrics` — operational gauges in plain-text exposition
/// format, one metric per line. Served regardless of readiness.
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.health.gauges().await {
        Ok(gauges) => (StatusCode::OK, HealthReporter::render(&gauges)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /crypto/status` — active key mode, label, and readiness.
pub async fn status(State(state): State<AppState>) -> Response {
    match state.health.status().await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /crypto/force-new-dek` — activate a brand-new DEK, bypassing
/// rotation. Refused with 409 while any encrypted record exists.
pub async fn force_new_dek(State(state): State<AppState>) -> Response {
    match state.manager.force_new_active_dek(&state.registry).await {
        Ok(key) => (
            StatusCode::OK,
            Json(ForceNewDekResponse {
                label: key.label.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /crypto/rotate/begin` — insert a rotating key and repoint the
/// write label at it.
pub async fn rotate_begin(State(state): State<AppState>) -> Response {
    match state.rotation.begin().await {
        Ok(key) => (
            StatusCode::OK,
            Json(RotateBeginResponse {
                rotating_label: key.label.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /crypto/rotate/run` — migrate one bounded batch of records.
pub async fn rotate_run(
    State(state): State<AppState>,
    body: Option<Json<RotateRunRequest>>,
) -> Response {
    let batch_size = body
        .and_then(|Json(req)| req.batch_size)
        .unwrap_or(state.default_batch_size);
    match state.rotation.run(Some(batch_size)).await {
        Ok(report) => (
            StatusCode::OK,
            Json(RotateRunResponse {
                migrated: report.migrated,
                remaining: report.remaining,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /crypto/rotate/finalize` — promote the rotating key once every
/// record is migrated; 409 with the remaining count otherwise.
pub async fn rotate_finalize(State(state): State<AppState>) -> Response {
    match state.rotation.finalize().await {
        Ok((promoted, retired)) => (
            StatusCode::OK,
            Json(RotateFinalizeResponse {
                active_label: promoted.label.to_string(),
                retired_label: retired.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /crypto/rewrap` — change how the active DEK is wrapped, in place.
///
/// Exactly one of `new_kek` (KEK replacement) or `to_kms` (KMS migration)
/// must be supplied.
pub async fn rewrap(State(state): State<AppState>, Json(req): Json<RewrapRequest>) -> Response {
    let result = match (req.to_kms, req.new_kek) {
        (Some(_), Some(_)) | (None, None) => Err(CryptoError::InvalidRequest(
            "supply exactly one of to_kms or new_kek".into(),
        )),
        (None, Some(encoded)) => match decode_kek(&encoded) {
            Ok(kek) => state.rewrap.rewrap_with_new_kek(kek).await,
            Err(e) => Err(e),
        },
        (Some(key_id), None) => {
            let kms = KmsBackend::new(state.kms_client.clone(), key_id)
                .with_timeout(state.kms_timeout)
                .with_max_retries(state.kms_max_retries);
            state.rewrap.rewrap_to_kms(&kms).await
        }
    };

    match result {
        Ok(key) => (
            StatusCode::OK,
            Json(RewrapResponse {
                scheme: key.wrapped.scheme.to_string(),
                kms_key_id: key.wrapped.kms_key_id,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "not_found",
            "the requested resource does not exist",
        )),
    )
}

fn decode_kek(encoded: &str) -> Result<DekBytes, CryptoError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidRequest("new_kek is not valid base64".into()))?;
    DekBytes::from_slice(&bytes).map_err(|_| CryptoError::InvalidKeyLength)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sealcore::wrap::env_kek::EnvKekBackend;
    use sealcore::wrap::kms::{KmsClient, KmsClientError};
    use sealcore::{
        Backends, FieldAccessor, HealthReporter, KeyManager, KeyStore, RewrapManager,
        RotationOrchestrator, WrapScheme,
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::server::router;
    use crate::tables;

    /// Test double: ciphertext equals plaintext, so wrap/unwrap round-trip.
    struct PassthroughKms;

    #[async_trait]
    impl KmsClient for PassthroughKms {
        async fn wrap(&self, _key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsClientError> {
            Ok(plaintext.to_vec())
        }

        async fn unwrap(&self, _key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsClientError> {
            Ok(ciphertext.to_vec())
        }
    }

    fn test_state(dir: &TempDir) -> AppState {
        let store = KeyStore::open(dir.path().join("keys.db"), 2).unwrap();
        store.apply_app_schema(tables::APP_SCHEMA).unwrap();

        let backends = Backends::new(WrapScheme::EnvKek)
            .with_env_kek(Arc::new(EnvKekBackend::new(DekBytes::generate())));
        let manager = Arc::new(KeyManager::new(store, backends));
        let registry = tables::encrypted_tables();

        AppState {
            rotation: Arc::new(RotationOrchestrator::new(manager.clone(), registry.clone())),
            rewrap: Arc::new(RewrapManager::new(manager.clone())),
            health: Arc::new(HealthReporter::new(manager.clone())),
            manager,
            registry,
            kms_client: Arc::new(PassthroughKms),
            kms_timeout: std::time::Duration::from_secs(1),
            kms_max_retries: 0,
            default_batch_size: 100,
        }
    }

    async fn request(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn ready_is_503_until_bootstrap() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));

        let req = Request::builder().uri("/health/ready").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = request(&app, "POST", "/crypto/force-new-dek", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "active");

        let req = Request::builder().uri("/health/ready").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_mode_and_label() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));

        let (status, body) = request(&app, "GET", "/crypto/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], false);

        request(&app, "POST", "/crypto/force-new-dek", None).await;
        let (_, body) = request(&app, "GET", "/crypto/status", None).await;
        assert_eq!(body["mode"], "env_kek");
        assert_eq!(body["label"], "active");
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn metrics_render_plain_text() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));
        request(&app, "POST", "/crypto/force-new-dek", None).await;

        let req = Request::builder().uri("/health/metrics").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("crypto_ready 1"));
        assert!(text.contains("crypto_mode{mode=\"env_kek\"} 1"));
        assert!(text.contains("crypto_keys_total 1"));
    }

    #[tokio::test]
    async fn rotation_workflow_over_http() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let app = router::build(state.clone());
        request(&app, "POST", "/crypto/force-new-dek", None).await;

        // Seed two encrypted records through the accessor.
        let accessor = FieldAccessor::new(state.manager.clone(), state.registry.clone());
        state
            .manager
            .store()
            .run(|conn| {
                conn.execute_batch(
                    "INSERT INTO customer_profiles (id, display_name) VALUES (1, 'a'), (2, 'b');",
                )
                .map_err(|e| CryptoError::Storage(e.to_string()))
            })
            .await
            .unwrap();
        accessor
            .write_field("customer_profiles", 1, "tax_id", b"tax-1")
            .await
            .unwrap();
        accessor
            .write_field("customer_profiles", 2, "tax_id", b"tax-2")
            .await
            .unwrap();

        // Finalize before begin is a user error.
        let (status, body) = request(&app, "POST", "/crypto/rotate/finalize", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "no_rotation_in_progress");

        let (status, body) = request(&app, "POST", "/crypto/rotate/begin", None).await;
        assert_eq!(status, StatusCode::OK);
        let rotating_label = body["rotating_label"].as_str().unwrap().to_owned();
        assert!(rotating_label.starts_with("rotating::"));

        // Premature finalize reports the remaining count.
        let (status, body) = request(&app, "POST", "/crypto/rotate/finalize", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "rotation_incomplete");

        let (status, body) = request(
            &app,
            "POST",
            "/crypto/rotate/run",
            Some(serde_json::json!({"batch_size": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["migrated"], 1);
        assert_eq!(body["remaining"], 1);

        let (_, body) = request(&app, "POST", "/crypto/rotate/run", None).await;
        assert_eq!(body["remaining"], 0);

        let (status, body) = request(&app, "POST", "/crypto/rotate/finalize", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_label"], "active");
        assert!(body["retired_label"].as_str().unwrap().starts_with("retired::"));

        // Records migrated and still readable.
        let value = accessor
            .read_field("customer_profiles", 1, "tax_id")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"tax-1"[..]));
    }

    #[tokio::test]
    async fn force_new_dek_refused_once_records_exist() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let app = router::build(state.clone());
        request(&app, "POST", "/crypto/force-new-dek", None).await;

        let accessor = FieldAccessor::new(state.manager.clone(), state.registry.clone());
        state
            .manager
            .store()
            .run(|conn| {
                conn.execute(
                    "INSERT INTO bank_connections (id, institution) VALUES (1, 'bank')",
                    [],
                )
                .map_err(|e| CryptoError::Storage(e.to_string()))
                .map(|_| ())
            })
            .await
            .unwrap();
        accessor
            .write_field("bank_connections", 1, "access_token", b"tok")
            .await
            .unwrap();

        let (status, body) = request(&app, "POST", "/crypto/force-new-dek", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "encrypted_records_exist");
    }

    #[tokio::test]
    async fn rewrap_validates_request_shape() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));
        request(&app, "POST", "/crypto/force-new-dek", None).await;

        let (status, body) =
            request(&app, "POST", "/crypto/rewrap", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");

        let (status, _) = request(
            &app,
            "POST",
            "/crypto/rewrap",
            Some(serde_json::json!({"to_kms": "k", "new_kek": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rewrap_to_kms_and_new_kek_over_http() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));
        request(&app, "POST", "/crypto/force-new-dek", None).await;

        let kek = STANDARD.encode(DekBytes::generate().as_bytes());
        let (status, body) = request(
            &app,
            "POST",
            "/crypto/rewrap",
            Some(serde_json::json!({"new_kek": kek})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheme"], "env_kek");

        let (status, body) = request(
            &app,
            "POST",
            "/crypto/rewrap",
            Some(serde_json::json!({"to_kms": "alias/ledgerseal"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheme"], "kms");
        assert_eq!(body["kms_key_id"], "alias/ledgerseal");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let dir = TempDir::new().unwrap();
        let app = router::build(test_state(&dir));
        let (status, body) = request(&app, "GET", "/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }
}
