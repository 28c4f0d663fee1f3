//! AES-256-GCM field encryption primitives.
//!
//! This module is intentionally free of storage and backend dependencies.
//! It provides the low-level encrypt/decrypt operations used by the key
//! manager and the wrap backends.
//!
//! Every encryption generates a fresh random 96-bit nonce via the OS CSPRNG;
//! the nonce is stored alongside the ciphertext, never reused across
//! operations under the same key.

pub mod cipher;

pub use cipher::{DekBytes, EncryptedValue, KEY_LEN, NONCE_LEN};
