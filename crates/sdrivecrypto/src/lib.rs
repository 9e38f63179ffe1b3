//! sdrivecrypto: Paillier encryption with split decryption for scoring
//! encrypted driving telemetry on an untrusted ledger.
//!
//! The owner generates and keeps the key pair, encrypts telemetry and answers
//! split-decryption requests. The ledger only ever holds the public key and
//! ciphertexts, aggregates them with [`homomorphic`] and recovers a result
//! through [`split`] without learning `lambda`.
//!
//! SECURITY NOTE: default keys use primes below 10 000 and are toy-strength.
//! The protocol shape is the point, not the key size.

pub mod bigint;
pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod homomorphic;
pub mod keys;
pub mod split;
pub mod store;

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

pub use decrypt::Decryptor;
pub use encrypt::{Ciphertext, Encryptor};
pub use error::{Error, Result};
pub use keys::{KeyGenParams, KeyPair, PublicKey, SecretKeyMaterial};
pub use split::{DerivedShare, SplitCoordinator, SplitRequest};
pub use store::{JsonFileKeyStore, KeyStore, MemoryKeyStore};

// --- Simple JSON (de)serialization helpers for key files ---

pub fn save_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

// ------------------- Tests -------------------
