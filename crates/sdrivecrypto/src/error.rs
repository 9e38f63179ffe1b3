use rug::Integer;

/// Failures surfaced by the cryptographic core.
///
/// Key generation retries its own rejections internally and never returns
/// them; everything listed here propagates to the caller and must not be
/// swallowed, since a silently wrong value ends up in a premium.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{value} has no inverse modulo {modulus}")]
    NoInverseExists { value: Integer, modulus: Integer },
    #[error("ciphertext was not produced under this key or was corrupted")]
    InvalidCiphertext,
    #[error("no private key material stored for owner `{0}`")]
    MissingKeyMaterial(String),
    #[error("plaintext {value} is outside [0, {modulus})")]
    OutOfRangePlaintext { value: Integer, modulus: Integer },
    #[error("blinding factor must lie in [1, {modulus})")]
    InvalidBlinding { modulus: Integer },
    #[error("request was bound to key {expected} but the local key is {actual}")]
    KeyMismatch { expected: String, actual: String },
    #[error("derived share for result `{0}` does not match the pending ciphertext")]
    InvalidShare(String),
    #[error("no pending split-decryption round for result `{0}`")]
    UnknownResult(String),
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(&'static str),
    #[error("invalid owner id `{0}`")]
    InvalidOwnerId(String),
    #[error("could not parse `{0}` as a decimal integer")]
    Parse(String),
    #[error("key store failure: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Store(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Store(value.to_string())
    }
}
