//! Interchangeable wrap backends for the Data Encryption Key.
//!
//! Two implementations of one contract: [`env_kek::EnvKekBackend`] performs
//! local AES-256-GCM under an operator-supplied KEK; [`kms::KmsBackend`]
//! delegates to an external key-management service and never sees the
//! wrapping key. Callers select a backend by [`WrapScheme`] tag through the
//! [`Backends`] registry, never by branching on the scheme themselves.

pub mod env_kek;
pub mod kms;

use std::sync::Arc;

use async_trait::async_trait;
use common::CryptoError;

use crate::crypto::DekBytes;

/// How a stored DEK is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapScheme {
    /// Local AES-256-GCM under the operator-supplied KEK.
    EnvKek,
    /// Wrapped by an external KMS; the wrapping key never enters the process.
    Kms,
}

impl WrapScheme {
    /// Canonical string form stored in the key table.
    pub fn as_str(&self) -> &'static str {
        match self {
            WrapScheme::EnvKek => "env_kek",
            WrapScheme::Kms => "kms",
        }
    }

    /// Parse the stored string form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Storage`] for an unrecognised scheme string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "env_kek" => Ok(WrapScheme::EnvKek),
            "kms" => Ok(WrapScheme::Kms),
            other => Err(CryptoError::Storage(format!(
                "unknown wrap scheme {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for WrapScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DEK wrapped for durable storage.
#[derive(Debug, Clone)]
pub struct WrappedDek {
    /// Ciphertext of the DEK under the KEK or the KMS key.
    pub ciphertext: Vec<u8>,
    /// Wrap nonce; non-empty only for [`WrapScheme::EnvKek`].
    pub nonce: Vec<u8>,
    /// Which backend produced this wrap.
    pub scheme: WrapScheme,
    /// KMS key identifier, required when `scheme` is [`WrapScheme::Kms`].
    pub kms_key_id: Option<String>,
}

/// Contract implemented by both wrap backends.
#[async_trait]
pub trait KeyWrapBackend: Send + Sync {
    /// The scheme this backend produces.
    fn scheme(&self) -> WrapScheme;

    /// Wrap a plaintext DEK for storage.
    async fn wrap(&self, dek: &DekBytes) -> Result<WrappedDek, CryptoError>;

    /// Unwrap a stored DEK back to plaintext.
    ///
    /// # Errors
    ///
    /// [`CryptoError::UnwrapAuth`] on authentication failure (wrong key
    /// material or tampered ciphertext); [`CryptoError::BackendUnavailable`]
    /// when the backend cannot be reached.
    async fn unwrap_dek(&self, wrapped: &WrappedDek) -> Result<DekBytes, CryptoError>;
}

/// Registry of configured backends, keyed by [`WrapScheme`].
///
/// The active scheme wraps every newly generated DEK; unwrapping dispatches
/// on the scheme recorded on the stored row, since retired keys may still be
/// wrapped under a scheme that is no longer the active one.
#[derive(Clone)]
pub struct Backends {
    env_kek: Option<Arc<dyn KeyWrapBackend>>,
    kms: Option<Arc<dyn KeyWrapBackend>>,
    active: WrapScheme,
}

impl Backends {
    /// Build a registry with `active` as the scheme for new wraps.
    pub fn new(active: WrapScheme) -> Self {
        Self {
            env_kek: None,
            kms: None,
            active,
        }
    }

    /// Register the env-KEK backend.
    pub fn with_env_kek(mut self, backend: Arc<dyn KeyWrapBackend>) -> Self {
        self.env_kek = Some(backend);
        self
    }

    /// Register the KMS backend.
    pub fn with_kms(mut self, backend: Arc<dyn KeyWrapBackend>) -> Self {
        self.kms = Some(backend);
        self
    }

    /// The backend used to wrap newly generated DEKs.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BackendUnavailable`] if the active scheme has
    /// no registered backend (a configuration error).
    pub fn active(&self) -> Result<&Arc<dyn KeyWrapBackend>, CryptoError> {
        self.for_scheme(self.active)
    }

    /// The scheme configured for new wraps.
    pub fn active_scheme(&self) -> WrapScheme {
        self.active
    }

    /// The backend matching a stored row's wrap scheme.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BackendUnavailable`] if no backend is
    /// registered for `scheme`.
    pub fn for_scheme(&self, scheme: WrapScheme) -> Result<&Arc<dyn KeyWrapBackend>, CryptoError> {
        let slot = match scheme {
            WrapScheme::EnvKek => &self.env_kek,
            WrapScheme::Kms => &self.kms,
        };
        slot.as_ref().ok_or_else(|| {
            CryptoError::BackendUnavailable(format!("no {scheme} backend configured"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::env_kek::EnvKekBackend;

    #[test]
    fn scheme_string_round_trip() {
        assert_eq!(WrapScheme::parse("env_kek").unwrap(), WrapScheme::EnvKek);
        assert_eq!(WrapScheme::parse("kms").unwrap(), WrapScheme::Kms);
        assert!(WrapScheme::parse("vault").is_err());
        assert_eq!(WrapScheme::EnvKek.as_str(), "env_kek");
        assert_eq!(WrapScheme::Kms.to_string(), "kms");
    }

    #[test]
    fn registry_dispatches_by_scheme() {
        let backend: Arc<dyn KeyWrapBackend> = Arc::new(EnvKekBackend::new(DekBytes::generate()));
        let backends = Backends::new(WrapScheme::EnvKek).with_env_kek(backend);

        assert!(backends.active().is_ok());
        assert!(backends.for_scheme(WrapScheme::EnvKek).is_ok());
        assert!(matches!(
            backends.for_scheme(WrapScheme::Kms),
            Err(CryptoError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn missing_active_backend_is_an_error() {
        let backends = Backends::new(WrapScheme::Kms);
        assert!(matches!(
            backends.active(),
            Err(CryptoError::BackendUnavailable(_))
        ));
    }
}
