//! AES-256-GCM encryption and decryption of individual field values.
//!
//! **Algorithm choice:** AES-256-GCM with a random 96-bit nonce per
//! operation. GCM requires that a nonce is never reused under the same key,
//! so the nonce is generated fresh from the OS CSPRNG on every encrypt call
//! and persisted next to the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Holds plaintext DEK or KEK material. When this type is dropped, the
/// memory is overwritten with zeroes to minimise the window during which
/// plaintext key material lives in RAM.
#[derive(Clone)]
pub struct DekBytes(Box<[u8; KEY_LEN]>);

impl DekBytes {
    /// Generate a fresh random key from the OS CSPRNG.
    pub fn generate() -> Self {
        use aes_gcm::aead::rand_core::RngCore;
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut buf[..]);
        Self(buf)
    }

    /// Build from a byte slice, which must be exactly [`KEY_LEN`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] otherwise.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Borrow the raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for DekBytes {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material — not even in debug builds.
        f.write_str("DekBytes([REDACTED])")
    }
}

/// An encrypted field value: ciphertext (with auth tag) plus its nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM decryption failed authentication (wrong key or tampered data),
    /// or encryption failed internally.
    #[error("aead operation failed")]
    AeadFailure,

    /// A stored nonce does not have [`NONCE_LEN`] bytes.
    #[error("invalid nonce length: expected {NONCE_LEN} bytes")]
    InvalidNonceLength,
}

/// Encrypt a plaintext field using AES-256-GCM under `key`.
///
/// A random 96-bit nonce is generated per call via the OS CSPRNG and
/// returned inside the [`EncryptedValue`].
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be
/// unreachable with a valid key and nonce).
pub fn encrypt(plaintext: &[u8], key: &DekBytes) -> Result<EncryptedValue, CipherError> {
    let cipher = build_cipher(key);

    use aes_gcm::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(EncryptedValue {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt an [`EncryptedValue`] back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key
/// or tampered data).
pub fn decrypt(value: &EncryptedValue, key: &DekBytes) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key);
    let nonce = Nonce::from_slice(&value.nonce);
    cipher
        .decrypt(nonce, value.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)
}

/// Rebuild an [`EncryptedValue`] from raw column bytes.
///
/// # Errors
///
/// Returns [`CipherError::InvalidNonceLength`] if the stored nonce is not
/// [`NONCE_LEN`] bytes.
pub fn value_from_parts(ciphertext: Vec<u8>, nonce: &[u8]) -> Result<EncryptedValue, CipherError> {
    if nonce.len() != NONCE_LEN {
        return Err(CipherError::InvalidNonceLength);
    }
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce);
    Ok(EncryptedValue {
        ciphertext,
        nonce: nonce_bytes,
    })
}

fn build_cipher(key: &DekBytes) -> Aes256Gcm {
    // Infallible: DekBytes is always KEY_LEN bytes.
    Aes256Gcm::new_from_slice(key.as_bytes()).expect("DekBytes has a fixed valid length")
}
