//! Ciphertext arithmetic the ledger is allowed to perform.
//!
//! Multiplication mod `n^2` and exponentiation by a public integer are the only
//! operations that preserve the plaintext relationship; anything else (adding
//! ciphertexts as integers, for instance) yields garbage on decryption.

use rug::Integer;

use crate::bigint;
use crate::{Ciphertext, PublicKey, Result};

/// `Dec(add(a, b)) == Dec(a) + Dec(b) mod n`.
pub fn add(pk: &PublicKey, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
    let n2 = pk.n_square();
    let prod: Integer = (a.as_integer() * b.as_integer()).into();
    Ciphertext::from_raw(prod % n2)
}

/// Fold of [`add`]. The empty sum is `1`, the encryption of zero with `r = 1`.
pub fn sum<'a, I>(pk: &PublicKey, ciphertexts: I) -> Ciphertext
where
    I: IntoIterator<Item = &'a Ciphertext>,
{
    let n2 = pk.n_square();
    let mut acc = Integer::from(1);
    for c in ciphertexts {
        acc *= c.as_integer();
        acc %= &n2;
    }
    Ciphertext::from_raw(acc)
}

/// `Dec(sub(a, b)) == Dec(a) - Dec(b) mod n`, by multiplying with `b^-1 mod n^2`.
///
/// Fails with `NoInverseExists` if `b` shares a factor with `n`.
pub fn sub(pk: &PublicKey, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
    let n2 = pk.n_square();
    let b_inv = bigint::mod_inverse(b.as_integer(), &n2)?;
    let prod: Integer = (a.as_integer() * &b_inv).into();
    Ok(Ciphertext::from_raw(prod % n2))
}

/// `Dec(scale(a, k)) == k * Dec(a) mod n`. Negative `k` is taken mod `n`.
pub fn scale(pk: &PublicKey, a: &Ciphertext, k: &Integer) -> Ciphertext {
    let k = bigint::reduce(k, pk.n());
    Ciphertext::from_raw(bigint::mod_pow(a.as_integer(), &k, &pk.n_square()))
}

pub fn scale_u64(pk: &PublicKey, a: &Ciphertext, k: u64) -> Ciphertext {
    scale(pk, a, &Integer::from(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decryptor, Encryptor, Error, KeyPair};
    use rand::rngs::OsRng;

    struct Fixture {
        pk: PublicKey,
        enc: Encryptor,
        dec: Decryptor,
    }

    fn textbook() -> Fixture {
        let dec = Decryptor::new(KeyPair::from_primes(Integer::from(61), Integer::from(53)).unwrap()).unwrap();
        let pk = dec.public_key();
        Fixture {
            enc: Encryptor::new(pk.clone()),
            pk,
            dec,
        }
    }

    fn fixed(f: &Fixture, m: i64, r: i64) -> Ciphertext {
        f.enc
            .encrypt_with_blinding(&Integer::from(m), &Integer::from(r))
            .unwrap()
    }

    #[test]
    fn add_fixed_vectors() {
        let f = textbook();
        let c1 = fixed(&f, 65, 17);
        let c2 = fixed(&f, 10, 23);
        assert_eq!(*c2.as_integer(), 935_102);
        assert_eq!(f.dec.decrypt(&add(&f.pk, &c1, &c2)).unwrap(), 75);
    }

    #[test]
    fn integer_addition_breaks_the_homomorphism() {
        let f = textbook();
        let c1 = fixed(&f, 65, 17);
        let c2 = fixed(&f, 10, 23);
        let raw: Integer = (c1.as_integer() + c2.as_integer()).into();
        let bogus = Ciphertext::from_raw(raw % f.pk.n_square());
        let out = f.dec.decrypt(&bogus).unwrap();
        assert_eq!(out, 702);
        assert_ne!(out, 75);
    }

    #[test]
    fn scale_fixed_vector() {
        let f = textbook();
        let c1 = fixed(&f, 65, 17);
        assert_eq!(f.dec.decrypt(&scale_u64(&f.pk, &c1, 3)).unwrap(), 195);
        assert_eq!(f.dec.decrypt(&scale_u64(&f.pk, &c1, 0)).unwrap(), 0);
    }

    #[test]
    fn negative_scale_wraps_mod_n() {
        let f = textbook();
        let c1 = fixed(&f, 65, 17);
        let out = f.dec.decrypt(&scale(&f.pk, &c1, &Integer::from(-1))).unwrap();
        assert_eq!(out, 3233 - 65);
    }

    #[test]
    fn sum_and_sub() {
        let f = textbook();
        // Fresh blindings each round; every one of them must stay invertible.
        for _ in 0..50 {
            let cs: Vec<Ciphertext> = [5u64, 7, 11, 13]
                .iter()
                .map(|&m| f.enc.encrypt_u64(m, &mut OsRng).unwrap())
                .collect();
            let total = sum(&f.pk, &cs);
            assert_eq!(f.dec.decrypt(&total).unwrap(), 36);

            let diff = sub(&f.pk, &total, &cs[3]).unwrap();
            assert_eq!(f.dec.decrypt(&diff).unwrap(), 23);
            let wrapped = sub(&f.pk, &cs[0], &cs[1]).unwrap();
            assert_eq!(f.dec.decrypt(&wrapped).unwrap(), 3233 - 2);
        }
        assert_eq!(f.dec.decrypt(&sum(&f.pk, std::iter::empty::<&Ciphertext>())).unwrap(), 0);
    }

    #[test]
    fn sub_rejects_non_unit() {
        let f = textbook();
        let c1 = fixed(&f, 65, 17);
        let not_unit = Ciphertext::from_raw(Integer::from(61));
        assert!(matches!(
            sub(&f.pk, &c1, &not_unit),
            Err(Error::NoInverseExists { .. })
        ));
    }
}
