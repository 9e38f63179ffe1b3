//! Usage-based insurance premium over encrypted telemetry.
//!
//! The ledger evaluates
//!
//! ```text
//! behaviour = w_speed*speeding + w_acc*hard_accelerations + w_brake*emergency_brakes
//!           + w_dist*unsafe_distance + w_zone*high_risk_zones + w_time*night_driving
//!           - w_traffic*traffic_signal_compliance
//! premium   = vehicle_type + purchase_mileage + year + alpha*mileage + beta*behaviour
//! ```
//!
//! on ciphertexts with [`premium_encrypted`], touching only scalar
//! multiplication, sums and one subtraction. [`premium_plain`] is the cleartext
//! baseline used to check it.

use rand::{CryptoRng, RngCore};
use rug::Integer;
use serde::{Deserialize, Serialize};
use tracing::trace;

use sdrivecrypto::homomorphic::{scale, sub, sum};
use sdrivecrypto::{Ciphertext, Encryptor, Error, PublicKey, Result};

/// Static attributes of a vehicle, all small non-negative integers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleAttributes {
    pub vehicle_type: u64,
    pub purchase_mileage: u64,
    pub year: u64,
}

/// Per-trip telemetry counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripMetrics {
    pub speeding: u64,
    pub hard_accelerations: u64,
    pub emergency_brakes: u64,
    pub unsafe_distance: u64,
    pub high_risk_zones: u64,
    pub traffic_signal_compliance: u64,
    pub night_driving: u64,
    pub mileage: u64,
}

/// Insurer-chosen public weights. `alpha` prices distance (pay as you drive),
/// `beta` prices the behaviour index (pay how you drive). Omitted weights
/// deserialize as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaWeights {
    pub weight_traffic: i64,
    pub weight_speed: i64,
    pub weight_acceleration: i64,
    pub weight_braking: i64,
    pub weight_distance: i64,
    pub weight_zone: i64,
    pub weight_time: i64,
    pub alpha: i64,
    pub beta: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVehicle {
    pub vehicle_type: Ciphertext,
    pub purchase_mileage: Ciphertext,
    pub year: Ciphertext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedTrip {
    pub speeding: Ciphertext,
    pub hard_accelerations: Ciphertext,
    pub emergency_brakes: Ciphertext,
    pub unsafe_distance: Ciphertext,
    pub high_risk_zones: Ciphertext,
    pub traffic_signal_compliance: Ciphertext,
    pub night_driving: Ciphertext,
    pub mileage: Ciphertext,
}

impl VehicleAttributes {
    pub fn encrypt<R: RngCore + CryptoRng>(&self, enc: &Encryptor, rng: &mut R) -> Result<EncryptedVehicle> {
        Ok(EncryptedVehicle {
            vehicle_type: enc.encrypt_u64(self.vehicle_type, rng)?,
            purchase_mileage: enc.encrypt_u64(self.purchase_mileage, rng)?,
            year: enc.encrypt_u64(self.year, rng)?,
        })
    }
}

impl TripMetrics {
    pub fn encrypt<R: RngCore + CryptoRng>(&self, enc: &Encryptor, rng: &mut R) -> Result<EncryptedTrip> {
        Ok(EncryptedTrip {
            speeding: enc.encrypt_u64(self.speeding, rng)?,
            hard_accelerations: enc.encrypt_u64(self.hard_accelerations, rng)?,
            emergency_brakes: enc.encrypt_u64(self.emergency_brakes, rng)?,
            unsafe_distance: enc.encrypt_u64(self.unsafe_distance, rng)?,
            high_risk_zones: enc.encrypt_u64(self.high_risk_zones, rng)?,
            traffic_signal_compliance: enc.encrypt_u64(self.traffic_signal_compliance, rng)?,
            night_driving: enc.encrypt_u64(self.night_driving, rng)?,
            mileage: enc.encrypt_u64(self.mileage, rng)?,
        })
    }
}

fn check_all(pk: &PublicKey, fields: &[&Ciphertext]) -> Result<()> {
    let n2 = pk.n_square();
    if fields
        .iter()
        .any(|c| *c.as_integer() < 0 || *c.as_integer() >= n2)
    {
        return Err(Error::InvalidCiphertext);
    }
    Ok(())
}

impl EncryptedVehicle {
    /// Range-check every field against `pk` before the record is accepted.
    pub fn validate(&self, pk: &PublicKey) -> Result<()> {
        check_all(pk, &[&self.vehicle_type, &self.purchase_mileage, &self.year])
    }
}

impl EncryptedTrip {
    pub fn validate(&self, pk: &PublicKey) -> Result<()> {
        check_all(
            pk,
            &[
                &self.speeding,
                &self.hard_accelerations,
                &self.emergency_brakes,
                &self.unsafe_distance,
                &self.high_risk_zones,
                &self.traffic_signal_compliance,
                &self.night_driving,
                &self.mileage,
            ],
        )
    }
}

/// Encrypted premium for one trip of one vehicle.
///
/// The result decrypts to the cleartext premium reduced mod `n`; a negative
/// premium comes back as `n - |premium|`, see [`centered`].
pub fn premium_encrypted(
    pk: &PublicKey,
    vehicle: &EncryptedVehicle,
    trip: &EncryptedTrip,
    weights: &CriteriaWeights,
) -> Result<Ciphertext> {
    let w = |k: i64| Integer::from(k);

    let weighted = [
        scale(pk, &trip.speeding, &w(weights.weight_speed)),
        scale(pk, &trip.hard_accelerations, &w(weights.weight_acceleration)),
        scale(pk, &trip.emergency_brakes, &w(weights.weight_braking)),
        scale(pk, &trip.unsafe_distance, &w(weights.weight_distance)),
        scale(pk, &trip.high_risk_zones, &w(weights.weight_zone)),
        scale(pk, &trip.night_driving, &w(weights.weight_time)),
    ];
    let compliance = scale(pk, &trip.traffic_signal_compliance, &w(weights.weight_traffic));
    let behaviour = sub(pk, &sum(pk, &weighted), &compliance)?;

    let payd = scale(pk, &trip.mileage, &w(weights.alpha));
    let phyd = scale(pk, &behaviour, &w(weights.beta));

    let total = sum(
        pk,
        [
            &vehicle.vehicle_type,
            &vehicle.purchase_mileage,
            &vehicle.year,
            &payd,
            &phyd,
        ],
    );
    trace!(premium = %total.to_decimal(), "computed encrypted premium");
    Ok(total)
}

/// Cleartext baseline of [`premium_encrypted`], over the integers.
pub fn premium_plain(vehicle: &VehicleAttributes, trip: &TripMetrics, weights: &CriteriaWeights) -> Integer {
    let term = |w: i64, x: u64| Integer::from(w) * x;

    let mut behaviour = term(weights.weight_speed, trip.speeding);
    behaviour += term(weights.weight_acceleration, trip.hard_accelerations);
    behaviour += term(weights.weight_braking, trip.emergency_brakes);
    behaviour += term(weights.weight_distance, trip.unsafe_distance);
    behaviour += term(weights.weight_zone, trip.high_risk_zones);
    behaviour += term(weights.weight_time, trip.night_driving);
    behaviour -= term(weights.weight_traffic, trip.traffic_signal_compliance);

    let mut premium = Integer::from(vehicle.vehicle_type);
    premium += vehicle.purchase_mileage;
    premium += vehicle.year;
    premium += term(weights.alpha, trip.mileage);
    premium += behaviour * weights.beta;
    premium
}

/// Map a residue in `[0, n)` to its representative in `(-n/2, n/2]`.
pub fn centered(v: Integer, n: &Integer) -> Integer {
    let mut half_n = n.clone();
    half_n >>= 1;
    if v > half_n {
        v - n
    } else {
        v
    }
}
