//! Arbitrary-precision helpers on top of `rug::Integer`.
//!
//! Addition, subtraction, multiplication and truncating remainder come straight
//! from `rug`'s operators. What lives here is the modular machinery the scheme
//! needs, written out so every call site shares one implementation.

use rug::Integer;

use crate::{Error, Result};

/// Reduce `value` into `[0, modulus)`. `modulus` must be positive.
pub fn reduce(value: &Integer, modulus: &Integer) -> Integer {
    let mut r: Integer = (value % modulus).into();
    if r < 0 {
        r += modulus;
    }
    r
}

pub fn gcd(mut a: Integer, mut b: Integer) -> Integer {
    while b != 0 {
        let r: Integer = (&a % &b).into();
        a = b;
        b = r;
    }
    a.abs()
}

pub fn lcm(a: &Integer, b: &Integer) -> Integer {
    let g = gcd(a.clone(), b.clone());
    let prod: Integer = (a * b).into();
    (prod / g).abs()
}

/// Returns `(g, x, y)` with `a*x + b*y == g == gcd(a, b)`.
pub fn extended_gcd(a: &Integer, b: &Integer) -> (Integer, Integer, Integer) {
    let (mut old_r, mut r) = (a.clone(), b.clone());
    let (mut old_s, mut s) = (Integer::from(1), Integer::new());
    let (mut old_t, mut t) = (Integer::new(), Integer::from(1));

    while r != 0 {
        let q: Integer = (&old_r / &r).into();

        let next_r = &old_r - Integer::from(&q * &r);
        old_r = std::mem::replace(&mut r, next_r);

        let next_s = &old_s - Integer::from(&q * &s);
        old_s = std::mem::replace(&mut s, next_s);

        let next_t = &old_t - Integer::from(&q * &t);
        old_t = std::mem::replace(&mut t, next_t);
    }

    if old_r < 0 {
        (-old_r, -old_s, -old_t)
    } else {
        (old_r, old_s, old_t)
    }
}

/// `a^-1 mod m`, in `[0, m)`.
pub fn mod_inverse(a: &Integer, m: &Integer) -> Result<Integer> {
    let (g, x, _) = extended_gcd(&reduce(a, m), m);
    if g != 1 {
        return Err(Error::NoInverseExists {
            value: a.clone(),
            modulus: m.clone(),
        });
    }
    Ok(reduce(&x, m))
}

/// Square-and-multiply `base^exponent mod modulus`.
///
/// `exponent` must be non-negative; it does not need to be reduced first.
pub fn mod_pow(base: &Integer, exponent: &Integer, modulus: &Integer) -> Integer {
    debug_assert!(*modulus > 0, "modulus must be positive");
    debug_assert!(*exponent >= 0, "exponent must be non-negative");
    if *modulus == 1 {
        return Integer::new();
    }

    let mut base = reduce(base, modulus);
    let mut exponent = exponent.clone();
    let mut result = Integer::from(1);

    while exponent > 0 {
        if exponent.is_odd() {
            result *= &base;
            result %= modulus;
        }
        exponent >>= 1;
        base.square_mut();
        base %= modulus;
    }
    result
}

pub fn parse_decimal(s: &str) -> Result<Integer> {
    Integer::from_str_radix(s.trim(), 10).map_err(|_| Error::Parse(s.to_string()))
}

pub fn to_decimal(value: &Integer) -> String {
    value.to_string_radix(10)
}

/// Serde adapter rendering an `Integer` as a decimal string.
pub mod decimal {
    use rug::Integer;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Integer, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&super::to_decimal(value))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Integer, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        super::parse_decimal(&s).map_err(D::Error::custom)
    }
}
