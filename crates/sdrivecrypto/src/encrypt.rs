use rand::{CryptoRng, RngCore};
use rug::integer::Order;
use rug::Integer;
use serde::{Deserialize, Serialize};

use crate::bigint::{self, decimal};
use crate::{Error, PublicKey, Result};

/// A Paillier ciphertext, an element of `[0, n^2)` for the key it was made under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(#[serde(with = "decimal")] Integer);

impl Ciphertext {
    /// Accept a value received from outside, checking it fits under `pk`.
    pub fn new(value: Integer, pk: &PublicKey) -> Result<Self> {
        if value < 0 || value >= pk.n_square() {
            return Err(Error::InvalidCiphertext);
        }
        Ok(Self(value))
    }

    pub fn from_decimal(s: &str, pk: &PublicKey) -> Result<Self> {
        Self::new(bigint::parse_decimal(s)?, pk)
    }

    /// Wrap a value produced by this crate's own arithmetic.
    pub(crate) fn from_raw(value: Integer) -> Self {
        Self(value)
    }

    pub fn as_integer(&self) -> &Integer {
        &self.0
    }

    pub fn into_integer(self) -> Integer {
        self.0
    }

    pub fn to_decimal(&self) -> String {
        bigint::to_decimal(&self.0)
    }
}

fn is_unit(r: &Integer, n: &Integer) -> bool {
    bigint::gcd(r.clone(), n.clone()) == 1
}

/// Uniform sample from the units of `Z_n`, by rejection over `bits(n)`-bit
/// strings. A blinding factor sharing a factor with `n` yields a ciphertext
/// that no longer decrypts.
pub(crate) fn sample_unit_range<R: RngCore + CryptoRng>(n: &Integer, rng: &mut R) -> Integer {
    let bits = n.significant_bits() as usize;
    let nbytes = (bits + 7) / 8;
    let excess = 8 * nbytes - bits;
    let mut bytes = vec![0u8; nbytes];
    loop {
        rng.fill_bytes(&mut bytes);
        if excess > 0 {
            bytes[0] &= 0xFFu8 >> excess;
        }
        let candidate = Integer::from_digits(&bytes[..], Order::MsfBe);
        if candidate > 0 && candidate < *n && is_unit(&candidate, n) {
            return candidate;
        }
    }
}

/// Owner-side encryption under a ledger-registered public key.
#[derive(Clone, Debug)]
pub struct Encryptor {
    pk: PublicKey,
    n_square: Integer,
}

impl Encryptor {
    pub fn new(pk: PublicKey) -> Self {
        let n_square = pk.n_square();
        Self { pk, n_square }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.pk
    }

    /// `c = (1 + m*n) * r^n mod n^2` with a fresh `r` drawn from `rng`.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, m: &Integer, rng: &mut R) -> Result<Ciphertext> {
        self.check_plaintext(m)?;
        let r = sample_unit_range(self.pk.n(), rng);
        Ok(self.encrypt_unchecked(m, &r))
    }

    pub fn encrypt_u64<R: RngCore + CryptoRng>(&self, m: u64, rng: &mut R) -> Result<Ciphertext> {
        self.encrypt(&Integer::from(m), rng)
    }

    /// Encrypt with a caller-chosen blinding factor, which must be a unit
    /// modulo `n`.
    ///
    /// Reusing `r` for two plaintexts under one key leaks their ratio; this
    /// exists for fixed-vector checks, not for production paths.
    pub fn encrypt_with_blinding(&self, m: &Integer, r: &Integer) -> Result<Ciphertext> {
        self.check_plaintext(m)?;
        if *r < 1 || r >= self.pk.n() || !is_unit(r, self.pk.n()) {
            return Err(Error::InvalidBlinding {
                modulus: self.pk.n().clone(),
            });
        }
        Ok(self.encrypt_unchecked(m, r))
    }

    fn check_plaintext(&self, m: &Integer) -> Result<()> {
        if *m < 0 || m >= self.pk.n() {
            return Err(Error::OutOfRangePlaintext {
                value: m.clone(),
                modulus: self.pk.n().clone(),
            });
        }
        Ok(())
    }

    fn encrypt_unchecked(&self, m: &Integer, r: &Integer) -> Ciphertext {
        let n = self.pk.n();
        let r_n = bigint::mod_pow(r, n, &self.n_square);
        let mut c: Integer = (m * n).into();
        c += 1;
        c *= r_n;
        c %= &self.n_square;
        Ciphertext(c)
    }
}
