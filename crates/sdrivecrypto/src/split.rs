//! Split decryption between the ledger and the key owner.
//!
//! Round trip for one `result_id`:
//! 1. the ledger holds an aggregated ciphertext `C`, opens a round and sends
//!    `R = C mod n` together with the fingerprint of the key it used;
//! 2. the owner answers with `r' = R^(n^-1 mod lambda) mod n`;
//! 3. the ledger checks `r'^n = C (mod n)`, strips `r'^n` from `C` and reads the
//!    plaintext off `(1 + m*n)`.
//!
//! The ledger never sees `lambda`, and the owner never has to hand over a
//! plaintext the ledger would have to trust.

use std::collections::HashMap;

use rug::Integer;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bigint::{self, decimal};
use crate::{Ciphertext, Decryptor, Error, PublicKey, Result};

/// Ledger to owner: the blinding value for one aggregation round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub result_id: String,
    #[serde(with = "decimal")]
    pub blinding: Integer,
    /// Fingerprint of the public key the aggregated ciphertext was built under.
    pub key_fingerprint: String,
}

/// Owner to ledger: the derived share closing the round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedShare {
    pub result_id: String,
    #[serde(with = "decimal")]
    pub r_prime: Integer,
}

/// `R = C mod n`. For `C = (1 + m*n) * r^n mod n^2` this is `r^n mod n`.
pub fn blinding_for(pk: &PublicKey, c: &Ciphertext) -> Integer {
    bigint::reduce(c.as_integer(), pk.n())
}

/// Owner side of the round.
///
/// Refuses with `KeyMismatch` when the ledger bound the request to a key other
/// than the one held locally; the share would be meaningless anyway.
pub fn respond(decryptor: &Decryptor, request: &SplitRequest) -> Result<DerivedShare> {
    let local = decryptor.public_key().fingerprint();
    if local != request.key_fingerprint {
        return Err(Error::KeyMismatch {
            expected: request.key_fingerprint.clone(),
            actual: local,
        });
    }
    Ok(DerivedShare {
        result_id: request.result_id.clone(),
        r_prime: decryptor.derive_share(&request.blinding),
    })
}

/// Ledger side: check the share against `C` and recover the plaintext.
pub fn verify_and_decrypt(pk: &PublicKey, c: &Ciphertext, r_prime: &Integer, result_id: &str) -> Result<Integer> {
    let n = pk.n();
    let n2 = pk.n_square();

    if *r_prime < 1 || r_prime >= n {
        return Err(Error::InvalidShare(result_id.to_string()));
    }
    if bigint::mod_pow(r_prime, n, n) != blinding_for(pk, c) {
        return Err(Error::InvalidShare(result_id.to_string()));
    }

    let s = bigint::mod_pow(r_prime, n, &n2);
    let s_inv = bigint::mod_inverse(&s, &n2)?;
    let unblinded: Integer = (c.as_integer() * &s_inv).into();
    let mut unblinded = bigint::reduce(&unblinded, &n2);
    unblinded -= 1;
    let (m, rem) = unblinded.div_rem(n.clone());
    if rem != 0 {
        return Err(Error::InvalidCiphertext);
    }
    Ok(m)
}

#[derive(Clone, Debug)]
struct PendingRound {
    pk: PublicKey,
    ciphertext: Ciphertext,
}

/// Ledger-side bookkeeping of open rounds, keyed by `result_id`.
///
/// A round is consumed by the first share that verifies. A rejected share
/// leaves the round open so a correct share can still close it.
#[derive(Debug, Default)]
pub struct SplitCoordinator {
    pending: HashMap<String, PendingRound>,
}

impl SplitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reopen) a round for `result_id` and produce the request to
    /// send to the owner.
    pub fn open(&mut self, result_id: impl Into<String>, pk: &PublicKey, ciphertext: Ciphertext) -> SplitRequest {
        let result_id = result_id.into();
        let request = SplitRequest {
            result_id: result_id.clone(),
            blinding: blinding_for(pk, &ciphertext),
            key_fingerprint: pk.fingerprint(),
        };
        let round = PendingRound {
            pk: pk.clone(),
            ciphertext,
        };
        if self.pending.insert(result_id.clone(), round).is_some() {
            debug!(%result_id, "replaced pending split-decryption round");
        }
        request
    }

    pub fn is_pending(&self, result_id: &str) -> bool {
        self.pending.contains_key(result_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Close the round named by `share`, returning the verified plaintext.
    pub fn finalize(&mut self, share: &DerivedShare) -> Result<Integer> {
        let round = self
            .pending
            .get(&share.result_id)
            .ok_or_else(|| Error::UnknownResult(share.result_id.clone()))?;
        match verify_and_decrypt(&round.pk, &round.ciphertext, &share.r_prime, &share.result_id) {
            Ok(m) => {
                self.pending.remove(&share.result_id);
                debug!(result_id = %share.result_id, "split-decryption round finalized");
                Ok(m)
            }
            Err(e) => {
                warn!(result_id = %share.result_id, error = %e, "rejected derived share");
                Err(e)
            }
        }
    }
}
