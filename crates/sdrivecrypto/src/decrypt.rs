use rug::Integer;

use crate::bigint;
use crate::{Ciphertext, Error, KeyPair, PublicKey, Result, SecretKeyMaterial};

/// Owner-side decryption. Holds the full key pair and never leaves the owner.
#[derive(Clone, Debug)]
pub struct Decryptor {
    key: KeyPair,
    /// `n^-1 mod lambda`, the exponent of the split-decryption share.
    n_inv_lambda: Integer,
}

impl Decryptor {
    /// Fails with `NoInverseExists` if the key material is inconsistent; that
    /// is a corrupted or mismatched key, not something to retry.
    pub fn new(key: KeyPair) -> Result<Self> {
        let n_inv_lambda = bigint::mod_inverse(key.n(), key.lambda())?;
        Ok(Self { key, n_inv_lambda })
    }

    pub fn from_secret(secret: &SecretKeyMaterial) -> Result<Self> {
        Self::new(KeyPair::from_secret(secret)?)
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// Standard Paillier decryption: `L(c^lambda mod n^2) * mu mod n`.
    pub fn decrypt(&self, c: &Ciphertext) -> Result<Integer> {
        let (n, n_square) = (self.key.n(), self.key.n_square());
        let c = c.as_integer();
        if *c < 0 || c >= n_square {
            return Err(Error::InvalidCiphertext);
        }

        let mut u = bigint::mod_pow(c, self.key.lambda(), n_square);
        u -= 1;
        let (l, rem) = u.div_rem(n.clone());
        if rem != 0 {
            return Err(Error::InvalidCiphertext);
        }
        let m: Integer = (&l * self.key.mu()).into();
        Ok(bigint::reduce(&m, n))
    }

    /// Derived share `r' = R^(n^-1 mod lambda) mod n` for a ledger-supplied
    /// blinding value `R`.
    ///
    /// Only a holder of `lambda` can compute this. When `R = v^n mod n` with
    /// `gcd(v, n) = 1`, the share is exactly `v mod n`.
    pub fn derive_share(&self, blinding: &Integer) -> Integer {
        bigint::mod_pow(blinding, &self.n_inv_lambda, self.key.n())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Encryptor;
    use rand::rngs::OsRng;

    fn textbook() -> Decryptor {
        Decryptor::new(KeyPair::from_primes(Integer::from(61), Integer::from(53)).unwrap()).unwrap()
    }

    #[test]
    fn fixed_vector() {
        let dec = textbook();
        let c = Ciphertext::from_decimal("2741887", &dec.public_key()).unwrap();
        assert_eq!(dec.decrypt(&c).unwrap(), 65);
    }

    #[test]
    fn textbook_share_recovers_blinding() {
        let dec = textbook();
        // R = 2741887 mod 3233, built from r = 17.
        assert_eq!(dec.derive_share(&Integer::from(303)), 17);
    }

    #[test]
    fn boundaries_round_trip() {
        let dec = Decryptor::new(KeyPair::generate(&mut OsRng)).unwrap();
        let enc = Encryptor::new(dec.public_key());
        let last = Integer::from(dec.key_pair().n() - 1u32);
        for m in [Integer::new(), Integer::from(1), last] {
            let c = enc.encrypt(&m, &mut OsRng).unwrap();
            assert_eq!(dec.decrypt(&c).unwrap(), m);
        }
        let n = dec.key_pair().n().clone();
        assert!(matches!(
            enc.encrypt(&n, &mut OsRng),
            Err(Error::OutOfRangePlaintext { .. })
        ));
    }

    #[test]
    fn rejects_values_outside_ciphertext_space() {
        let dec = textbook();
        assert_eq!(
            dec.decrypt(&Ciphertext::from_raw(Integer::from(10_452_289))),
            Err(Error::InvalidCiphertext)
        );
        // 0 is not a unit, so u - 1 = -1 is not divisible by n.
        assert_eq!(
            dec.decrypt(&Ciphertext::from_raw(Integer::new())),
            Err(Error::InvalidCiphertext)
        );
    }

    #[test]
    fn foreign_key_ciphertext_does_not_decrypt_to_plaintext() {
        let owner = textbook();
        let other = Decryptor::new(KeyPair::from_primes(Integer::from(1009), Integer::from(1013)).unwrap()).unwrap();
        let c = Encryptor::new(other.public_key())
            .encrypt_with_blinding(&Integer::from(65), &Integer::from(17))
            .unwrap();
        // Reduce into the owner's ciphertext space so only the key differs.
        let foreign = Ciphertext::from_raw(bigint::reduce(c.as_integer(), owner.key_pair().n_square()));
        assert_eq!(owner.decrypt(&foreign).unwrap(), 2310);
    }

    #[test]
    fn decryption_is_idempotent() {
        let dec = textbook();
        let c = Ciphertext::from_decimal("2741887", &dec.public_key()).unwrap();
        let first = dec.decrypt(&c).unwrap();
        for _ in 0..5 {
            assert_eq!(dec.decrypt(&c).unwrap(), first);
        }
    }
}
