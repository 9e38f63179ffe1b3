//! Key generation and key material.
//!
//! SECURITY NOTE: primes are drawn from a small band and tested by trial
//! division. That keeps the structure of Paillier intact but gives toy-strength
//! keys; trial division does not scale to cryptographic sizes.

use std::fmt;

use rand::{CryptoRng, Rng, RngCore};
use rug::integer::IsPrime;
use rug::Integer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::bigint::{self, decimal};
use crate::{Error, Result};

pub const DEFAULT_PRIME_MIN: u64 = 1_000;
pub const DEFAULT_PRIME_MAX: u64 = 10_000;

/// Candidates above this are too large for trial division to stay cheap.
const TRIAL_DIVISION_LIMIT: u64 = 1 << 40;

/// Half-open band `[min, max)` the key generator samples primes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenParams {
    pub min: u64,
    pub max: u64,
}

impl Default for KeyGenParams {
    fn default() -> Self {
        Self {
            min: DEFAULT_PRIME_MIN,
            max: DEFAULT_PRIME_MAX,
        }
    }
}

impl KeyGenParams {
    fn validate(&self) -> Result<()> {
        if self.min < 3 || self.max <= self.min + 1 {
            return Err(Error::InvalidKeyMaterial("prime band must satisfy 3 <= min < max - 1"));
        }
        if self.max > TRIAL_DIVISION_LIMIT {
            return Err(Error::InvalidKeyMaterial("prime band exceeds the trial-division limit"));
        }
        Ok(())
    }
}

/// Why a candidate pair was thrown away during generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rejection {
    EqualPrimes,
    ModulusSharesFactorWithLambda,
}

/// Trial division by every integer in `[2, isqrt(candidate)]`.
pub fn is_prime_trial(candidate: u64) -> bool {
    if candidate < 2 {
        return false;
    }
    let mut d = 2u64;
    while d * d <= candidate {
        if candidate % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

fn random_prime<R: RngCore + CryptoRng>(params: &KeyGenParams, rng: &mut R) -> u64 {
    loop {
        let candidate = rng.gen_range(params.min..params.max);
        if is_prime_trial(candidate) {
            return candidate;
        }
    }
}

fn is_prime(value: &Integer) -> bool {
    match value.to_u64() {
        Some(v) if v <= TRIAL_DIVISION_LIMIT => is_prime_trial(v),
        _ => value.is_probably_prime(30) != IsPrime::No,
    }
}

/// The public projection of a key pair: the only part a ledger ever sees.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPublicKey")]
pub struct PublicKey {
    #[serde(with = "decimal")]
    n: Integer,
}

/// Wire shape of [`PublicKey`]; deserialization goes through [`PublicKey::new`].
#[derive(Deserialize)]
struct RawPublicKey {
    #[serde(with = "decimal")]
    n: Integer,
}

impl TryFrom<RawPublicKey> for PublicKey {
    type Error = Error;

    fn try_from(raw: RawPublicKey) -> Result<Self> {
        Self::new(raw.n)
    }
}

impl PublicKey {
    pub fn new(n: Integer) -> Result<Self> {
        if n < 6 {
            return Err(Error::InvalidKeyMaterial("public modulus is too small"));
        }
        Ok(Self { n })
    }

    pub fn n(&self) -> &Integer {
        &self.n
    }

    pub fn n_square(&self) -> Integer {
        self.n.clone().square()
    }

    /// SHA-256 of the decimal modulus, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(bigint::to_decimal(&self.n).as_bytes()))
    }
}

/// What the owner persists. Everything else is re-derived from `p` and `q`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyMaterial {
    #[serde(with = "decimal")]
    pub p: Integer,
    #[serde(with = "decimal")]
    pub q: Integer,
}

impl fmt::Debug for SecretKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKeyMaterial(<redacted>)")
    }
}

/// Full Paillier key pair with `g = n + 1`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    p: Integer,
    q: Integer,
    n: Integer,
    n_square: Integer,
    lambda: Integer,
    mu: Integer,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("n", &self.n)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a key pair with primes from the default band.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::generate_in(&KeyGenParams::default(), rng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(params: &KeyGenParams, rng: &mut R) -> Result<Self> {
        params.validate()?;
        Ok(Self::generate_in(params, rng))
    }

    /// Resample until a pair satisfying every invariant turns up.
    ///
    /// There is no fixed bound on the number of attempts.
    fn generate_in<R: RngCore + CryptoRng>(params: &KeyGenParams, rng: &mut R) -> Self {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let p = random_prime(params, rng);
            let q = random_prime(params, rng);
            match Self::derive(Integer::from(p), Integer::from(q)) {
                Ok(pair) => {
                    debug!(attempts, n = %pair.n, "generated paillier key pair");
                    return pair;
                }
                Err(reason) => debug!(attempts, p, q, ?reason, "rejected prime pair"),
            }
        }
    }

    /// Rebuild a key pair from persisted primes, checking the same invariants
    /// the generator enforces.
    pub fn from_primes(p: Integer, q: Integer) -> Result<Self> {
        if !is_prime(&p) || !is_prime(&q) {
            return Err(Error::InvalidKeyMaterial("p and q must both be prime"));
        }
        Self::derive(p, q).map_err(|reason| match reason {
            Rejection::EqualPrimes => Error::InvalidKeyMaterial("p and q must differ"),
            Rejection::ModulusSharesFactorWithLambda => {
                Error::InvalidKeyMaterial("gcd(n, lambda) must be 1")
            }
        })
    }

    pub fn from_secret(secret: &SecretKeyMaterial) -> Result<Self> {
        Self::from_primes(secret.p.clone(), secret.q.clone())
    }

    fn derive(p: Integer, q: Integer) -> std::result::Result<Self, Rejection> {
        if p == q {
            return Err(Rejection::EqualPrimes);
        }
        let n: Integer = (&p * &q).into();
        let n_square: Integer = (&n * &n).into();
        let lambda = bigint::lcm(&(p.clone() - 1), &(q.clone() - 1));
        if bigint::gcd(n.clone(), lambda.clone()) != 1 {
            return Err(Rejection::ModulusSharesFactorWithLambda);
        }
        // gcd(n, lambda) == 1 already guarantees the inverse.
        let mu = bigint::mod_inverse(&lambda, &n)
            .map_err(|_| Rejection::ModulusSharesFactorWithLambda)?;
        Ok(Self {
            p,
            q,
            n,
            n_square,
            lambda,
            mu,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { n: self.n.clone() }
    }

    pub fn secret(&self) -> SecretKeyMaterial {
        SecretKeyMaterial {
            p: self.p.clone(),
            q: self.q.clone(),
        }
    }

    pub fn n(&self) -> &Integer {
        &self.n
    }
    pub fn n_square(&self) -> &Integer {
        &self.n_square
    }
    pub fn lambda(&self) -> &Integer {
        &self.lambda
    }
    pub fn mu(&self) -> &Integer {
        &self.mu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn textbook_pair() {
        let pair = KeyPair::from_primes(Integer::from(61), Integer::from(53)).unwrap();
        assert_eq!(*pair.n(), 3233);
        assert_eq!(*pair.n_square(), 10_452_289);
        assert_eq!(*pair.lambda(), 780);
        assert_eq!(*pair.mu(), 1173);
    }

    #[test]
    fn trial_division() {
        let primes: Vec<u64> = (0..30).filter(|&v| is_prime_trial(v)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert!(is_prime_trial(9973));
        assert!(!is_prime_trial(9971));
    }

    #[test]
    fn generated_pairs_hold_invariants() {
        let mut rng = OsRng;
        for _ in 0..25 {
            let pair = KeyPair::generate(&mut rng);
            let secret = pair.secret();
            assert_ne!(secret.p, secret.q);
            assert!(is_prime_trial(secret.p.to_u64().unwrap()));
            assert!(is_prime_trial(secret.q.to_u64().unwrap()));
            assert!((DEFAULT_PRIME_MIN..DEFAULT_PRIME_MAX).contains(&secret.p.to_u64().unwrap()));
            assert_eq!(bigint::gcd(pair.n().clone(), pair.lambda().clone()), 1);
            let check: Integer = (pair.lambda() * pair.mu()).into();
            assert_eq!(bigint::reduce(&check, pair.n()), 1);
        }
    }

    #[test]
    fn rejects_equal_or_composite_primes() {
        assert_eq!(
            KeyPair::from_primes(Integer::from(61), Integer::from(61)),
            Err(Error::InvalidKeyMaterial("p and q must differ"))
        );
        assert!(KeyPair::from_primes(Integer::from(60), Integer::from(53)).is_err());
    }

    #[test]
    fn rejects_shared_factor_with_lambda() {
        // lambda = lcm(2, 6) = 6 shares the factor 3 with n = 21.
        assert_eq!(
            KeyPair::from_primes(Integer::from(3), Integer::from(7)),
            Err(Error::InvalidKeyMaterial("gcd(n, lambda) must be 1"))
        );
    }

    #[test]
    fn secret_round_trip_through_json() {
        let pair = KeyPair::generate(&mut OsRng);
        let json = serde_json::to_string(&pair.secret()).unwrap();
        assert!(json.contains(&bigint::to_decimal(&pair.secret().p)));
        let back: SecretKeyMaterial = serde_json::from_str(&json).unwrap();
        assert_eq!(KeyPair::from_secret(&back).unwrap(), pair);
    }

    #[test]
    fn debug_hides_private_parts() {
        let pair = KeyPair::from_primes(Integer::from(61), Integer::from(53)).unwrap();
        let rendered = format!("{pair:?} {:?}", pair.secret());
        assert!(rendered.contains("3233"));
        assert!(!rendered.contains("780"));
        assert!(!rendered.contains("61"));
    }

    #[test]
    fn fingerprint_tracks_modulus() {
        let a = KeyPair::from_primes(Integer::from(61), Integer::from(53)).unwrap();
        let b = KeyPair::from_primes(Integer::from(1009), Integer::from(1013)).unwrap();
        assert_eq!(a.public_key().fingerprint(), a.public_key().fingerprint());
        assert_ne!(a.public_key().fingerprint(), b.public_key().fingerprint());
        assert_eq!(a.public_key().fingerprint().len(), 64);
    }

    #[test]
    fn public_key_from_the_wire_is_validated() {
        let pk: PublicKey = serde_json::from_str(r#"{"n":"3233"}"#).unwrap();
        assert_eq!(*pk.n(), 3233);
        for bad in [r#"{"n":"1"}"#, r#"{"n":"-3233"}"#, r#"{"n":"0"}"#] {
            assert!(serde_json::from_str::<PublicKey>(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn band_validation() {
        let bad = KeyGenParams { min: 10, max: 11 };
        assert!(KeyPair::generate_with(&bad, &mut OsRng).is_err());
    }
}
