//! Wrap backend that delegates to an external Key Management Service.
//!
//! The wrapping key never enters this process: `wrap` and `unwrap` forward
//! the DEK material to the remote service and return its response. Calls are
//! network I/O, so each attempt runs under a timeout and transient failures
//! are retried with exponential backoff. Authentication failures are never
//! retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::CryptoError;
use thiserror::Error;
use tracing::warn;

use crate::crypto::DekBytes;

use super::{KeyWrapBackend, WrapScheme, WrappedDek};

/// Classified failure from a KMS client call.
#[derive(Debug, Error)]
pub enum KmsClientError {
    /// The service rejected the ciphertext or key (wrong key, tampered
    /// blob, revoked grant). Retrying cannot help.
    #[error("KMS rejected the request: invalid ciphertext or key")]
    Auth,

    /// The service could not be reached or returned a transient failure.
    #[error("KMS unavailable: {0}")]
    Unavailable(String),
}

/// Minimal client contract against the external service.
///
/// `aws-sdk-kms` provides the production implementation; tests substitute a
/// mock. Keyed by an opaque key identifier; no cloud-specific semantics
/// leak past this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Encrypt `plaintext` under the remote key, returning the ciphertext.
    async fn wrap(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsClientError>;

    /// Decrypt `ciphertext` under the remote key, returning the plaintext.
    async fn unwrap(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsClientError>;
}

/// Production [`KmsClient`] over the AWS SDK.
pub struct AwsKmsClient {
    client: aws_sdk_kms::Client,
}

impl AwsKmsClient {
    /// Initialise from the standard AWS credential chain.
    pub async fn init() -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            client: aws_sdk_kms::Client::new(&config),
        }
    }

    /// Wrap an already-constructed SDK client (custom endpoint, tests).
    pub fn from_client(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KmsClient for AwsKmsClient {
    async fn wrap(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsClientError> {
        let resp = self
            .client
            .encrypt()
            .key_id(key_id)
            .plaintext(aws_sdk_kms::primitives::Blob::new(plaintext))
            .send()
            .await
            .map_err(|e| KmsClientError::Unavailable(e.to_string()))?;

        resp.ciphertext_blob()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| {
                KmsClientError::Unavailable("KMS encrypt response contained no ciphertext".into())
            })
    }

    async fn unwrap(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsClientError> {
        let resp = self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| {
                let svc = e.into_service_error();
                if svc.is_invalid_ciphertext_exception() || svc.is_incorrect_key_exception() {
                    KmsClientError::Auth
                } else {
                    KmsClientError::Unavailable(svc.to_string())
                }
            })?;

        resp.plaintext()
            .map(|b| b.as_ref().to_vec())
            .ok_or_else(|| {
                KmsClientError::Unavailable("KMS decrypt response contained no plaintext".into())
            })
    }
}

/// KMS-delegating wrap backend with timeout and bounded retry.
pub struct KmsBackend {
    client: Arc<dyn KmsClient>,
    key_id: String,
    timeout: Duration,
    max_retries: u32,
}

impl KmsBackend {
    /// Build a backend over `client` wrapping under `key_id`.
    pub fn new(client: Arc<dyn KmsClient>, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry budget for transient failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The key identifier this backend wraps under.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Run one KMS call with a timeout, retrying transient failures with
    /// exponential backoff. Auth failures abort immediately.
    async fn with_retries<F, Fut>(&self, op: &str, call: F) -> Result<Vec<u8>, CryptoError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, KmsClientError>>,
    {
        let mut delay = Duration::from_millis(200);
        let mut last_err = String::new();

        for attempt in 0..=self.max_retries {
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(KmsClientError::Auth)) => return Err(CryptoError::UnwrapAuth),
                Ok(Err(KmsClientError::Unavailable(msg))) => {
                    warn!(op, attempt, error = %msg, "KMS call failed; will retry");
                    last_err = msg;
                }
                Err(_) => {
                    warn!(op, attempt, timeout_secs = self.timeout.as_secs(), "KMS call timed out");
                    last_err = format!("timed out after {:?}", self.timeout);
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(CryptoError::BackendUnavailable(format!(
            "KMS {op} failed after {} attempts: {last_err}",
            self.max_retries + 1
        )))
    }
}

#[async_trait]
impl KeyWrapBackend for KmsBackend {
    fn scheme(&self) -> WrapScheme {
        WrapScheme::Kms
    }

    async fn wrap(&self, dek: &DekBytes) -> Result<WrappedDek, CryptoError> {
        let ciphertext = self
            .with_retries("wrap", || self.client.wrap(&self.key_id, dek.as_bytes()))
            .await?;
        Ok(WrappedDek {
            ciphertext,
            nonce: Vec::new(),
            scheme: WrapScheme::Kms,
            kms_key_id: Some(self.key_id.clone()),
        })
    }

    async fn unwrap_dek(&self, wrapped: &WrappedDek) -> Result<DekBytes, CryptoError> {
        let key_id = wrapped.kms_key_id.as_deref().unwrap_or(&self.key_id);
        let key_id = key_id.to_owned();
        let plaintext = self
            .with_retries("unwrap", || self.client.unwrap(&key_id, &wrapped.ciphertext))
            .await?;
        DekBytes::from_slice(&plaintext).map_err(|_| CryptoError::UnwrapAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use mockall::predicate::*;

    fn fast(backend: KmsBackend) -> KmsBackend {
        backend
            .with_timeout(Duration::from_millis(200))
            .with_max_retries(1)
    }

    #[tokio::test]
    async fn wrap_returns_kms_scheme_with_empty_nonce() {
        let mut mock = MockKmsClient::new();
        mock.expect_wrap()
            .with(eq("key-1"), always())
            .returning(|_, _| Ok(vec![0xAA; 48]));

        let backend = fast(KmsBackend::new(Arc::new(mock), "key-1"));
        let wrapped = backend.wrap(&DekBytes::generate()).await.unwrap();

        assert_eq!(wrapped.scheme, WrapScheme::Kms);
        assert!(wrapped.nonce.is_empty());
        assert_eq!(wrapped.kms_key_id.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn unwrap_round_trips_plaintext() {
        let mut mock = MockKmsClient::new();
        mock.expect_unwrap()
            .returning(|_, _| Ok(vec![0x42; KEY_LEN]));

        let backend = fast(KmsBackend::new(Arc::new(mock), "key-1"));
        let wrapped = WrappedDek {
            ciphertext: vec![0xAA; 48],
            nonce: Vec::new(),
            scheme: WrapScheme::Kms,
            kms_key_id: Some("key-1".into()),
        };
        let dek = backend.unwrap_dek(&wrapped).await.unwrap();
        assert_eq!(dek.as_bytes(), &[0x42; KEY_LEN]);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let mut mock = MockKmsClient::new();
        mock.expect_unwrap()
            .times(1)
            .returning(|_, _| Err(KmsClientError::Auth));

        let backend = KmsBackend::new(Arc::new(mock), "key-1").with_max_retries(5);
        let wrapped = WrappedDek {
            ciphertext: vec![1],
            nonce: Vec::new(),
            scheme: WrapScheme::Kms,
            kms_key_id: None,
        };
        assert!(matches!(
            backend.unwrap_dek(&wrapped).await,
            Err(CryptoError::UnwrapAuth)
        ));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_surfaces_unavailable() {
        let mut mock = MockKmsClient::new();
        mock.expect_wrap()
            .times(3)
            .returning(|_, _| Err(KmsClientError::Unavailable("connection refused".into())));

        let backend = KmsBackend::new(Arc::new(mock), "key-1")
            .with_max_retries(2)
            .with_timeout(Duration::from_millis(200));
        assert!(matches!(
            backend.wrap(&DekBytes::generate()).await,
            Err(CryptoError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let mut mock = MockKmsClient::new();
        let mut calls = 0;
        mock.expect_wrap().times(2).returning_st(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(KmsClientError::Unavailable("throttled".into()))
            } else {
                Ok(vec![0xBB; 48])
            }
        });

        let backend = KmsBackend::new(Arc::new(mock), "key-1")
            .with_max_retries(2)
            .with_timeout(Duration::from_millis(200));
        let wrapped = backend.wrap(&DekBytes::generate()).await.unwrap();
        assert_eq!(wrapped.ciphertext, vec![0xBB; 48]);
    }

    #[tokio::test]
    async fn short_plaintext_from_kms_is_an_auth_error() {
        let mut mock = MockKmsClient::new();
        mock.expect_unwrap().returning(|_, _| Ok(vec![0x42; 16]));

        let backend = fast(KmsBackend::new(Arc::new(mock), "key-1"));
        let wrapped = WrappedDek {
            ciphertext: vec![1],
            nonce: Vec::new(),
            scheme: WrapScheme::Kms,
            kms_key_id: None,
        };
        assert!(matches!(
            backend.unwrap_dek(&wrapped).await,
            Err(CryptoError::UnwrapAuth)
        ));
    }
}
