//! Messages exchanged between a data owner and the ledger.
//!
//! Every big integer crosses the wire as a decimal string, including inside
//! bincode frames, so a ledger written against another big-integer library
//! reads the same values.

use rug::Integer;
use serde::{Deserialize, Serialize};

use sdrivealgo::{EncryptedTrip, EncryptedVehicle};
use sdrivecrypto::bigint::decimal;
use sdrivecrypto::{Ciphertext, DerivedShare, PublicKey, SplitRequest};

pub const PROTO_VER: u32 = 1;

/// Opening message, sent by both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub proto_ver: u32,
    pub node_id: String,
    pub nonce: [u8; 16],
}

/// Register the owner's public key. Registration is once per owner; a second
/// registration with a different key is refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterKey {
    pub owner_id: String,
    pub public_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub owner_id: String,
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitVehicle {
    pub owner_id: String,
    pub vehicle_id: String,
    pub vehicle: EncryptedVehicle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTrip {
    pub vehicle_id: String,
    pub trip_id: String,
    /// ISO 8601 day, `YYYY-MM-DD`.
    pub date: String,
    pub trip: EncryptedTrip,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub id: String,
}

/// Ask the ledger to price one trip under a named set of criteria weights.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremiumReq {
    pub vehicle_id: String,
    pub trip_id: String,
    pub criteria_id: String,
}

/// The encrypted premium plus the split-decryption request that opens its
/// round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremiumOffer {
    pub result_id: String,
    pub premium: Ciphertext,
    pub request: SplitRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSubmit {
    pub share: DerivedShare,
}

/// Verified plaintext premium, as a signed integer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalized {
    pub result_id: String,
    #[serde(with = "decimal")]
    pub premium: Integer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub reason: String,
    /// Whether resending the same request may succeed.
    pub retryable: bool,
}

/// `result_<trip_id>`: one premium round per trip.
pub fn result_id_for(trip_id: &str) -> String {
    format!("result_{trip_id}")
}
