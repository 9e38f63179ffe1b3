//! Ledger state machine and its QUIC server loop.
//!
//! The ledger holds public keys and ciphertexts only. It prices a trip
//! homomorphically, opens a split-decryption round for the result and commits
//! the premium once the owner's share verifies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quinn::Endpoint;
use rug::Integer;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sdrivealgo::{centered, premium_encrypted, CriteriaWeights, EncryptedTrip, EncryptedVehicle};
use sdrivecrypto::{PublicKey, SplitCoordinator};
use sdriveproto::result_id_for;

use crate::{
    read_msg, send_msg, Finalized, FrameError, Hello, Msg, PremiumOffer, PremiumReq, RegisterAck, RegisterKey,
    ShareSubmit, SubmitAck, SubmitTrip, SubmitVehicle, PROTO_VER,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("protocol version {got} is not supported")]
    VersionMismatch { got: u32 },
    #[error("owner `{0}` has not registered a public key")]
    UnknownOwner(String),
    #[error("owner `{0}` already registered a different public key")]
    KeyAlreadyRegistered(String),
    #[error("vehicle `{0}` is not known")]
    UnknownVehicle(String),
    #[error("trip `{0}` is not known")]
    UnknownTrip(String),
    #[error("criteria weights `{0}` are not configured")]
    UnknownCriteria(String),
    #[error("`{0}` was already submitted with different content")]
    Conflict(String),
    #[error("trip `{trip_id}` belongs to vehicle `{actual}`, not `{requested}`")]
    TripVehicleMismatch {
        trip_id: String,
        requested: String,
        actual: String,
    },
    #[error("invalid trip date `{0}`, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("`{0}` is not a request the ledger serves")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Crypto(#[from] sdrivecrypto::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct VehicleEntry {
    owner_id: String,
    record: EncryptedVehicle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TripEntry {
    vehicle_id: String,
    date: String,
    year: i32,
    month: u32,
    record: EncryptedTrip,
}

/// A round handed to the owner and not yet closed.
#[derive(Clone, Debug)]
struct OpenOffer {
    trip_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedPremium {
    pub trip_id: String,
    pub vehicle_id: String,
    pub date: String,
    pub premium: Integer,
}

/// `(year, month)` from a `YYYY-MM-DD` date.
pub fn year_month(date: &str) -> Option<(i32, u32)> {
    let mut parts = date.splitn(3, '-');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    let day = parts.next()?.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some((year, month))
}

#[derive(Debug)]
pub struct Ledger {
    node_id: String,
    criteria: BTreeMap<String, CriteriaWeights>,
    keys: HashMap<String, PublicKey>,
    vehicles: HashMap<String, VehicleEntry>,
    trips: HashMap<String, TripEntry>,
    rounds: SplitCoordinator,
    offers: HashMap<String, OpenOffer>,
    premiums: HashMap<String, CommittedPremium>,
    /// Last accepted share per result, so a resent `ShareSubmit` gets the same answer.
    closed: HashMap<String, (Integer, Finalized)>,
    monthly: BTreeMap<(String, i32, u32), Integer>,
}

impl Ledger {
    pub fn new(node_id: impl Into<String>, criteria: BTreeMap<String, CriteriaWeights>) -> Self {
        Self {
            node_id: node_id.into(),
            criteria,
            keys: HashMap::new(),
            vehicles: HashMap::new(),
            trips: HashMap::new(),
            rounds: SplitCoordinator::new(),
            offers: HashMap::new(),
            premiums: HashMap::new(),
            closed: HashMap::new(),
            monthly: BTreeMap::new(),
        }
    }

    /// Answer one request. Domain failures become a non-retryable `Rejected`.
    pub fn handle(&mut self, msg: Msg) -> Msg {
        let kind = msg.kind();
        let outcome = match msg {
            Msg::Hello(h) => self.hello(h).map(Msg::Hello),
            Msg::RegisterKey(r) => self.register_key(r).map(Msg::RegisterAck),
            Msg::SubmitVehicle(v) => self.submit_vehicle(v).map(Msg::SubmitAck),
            Msg::SubmitTrip(t) => self.submit_trip(t).map(Msg::SubmitAck),
            Msg::PremiumReq(p) => self.request_premium(p).map(Msg::PremiumOffer),
            Msg::ShareSubmit(s) => self.finalize(s).map(Msg::Finalized),
            other => Err(LedgerError::UnexpectedMessage(other.kind())),
        };
        match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request = kind, error = %e, "rejected request");
                Msg::rejected(e.to_string(), false)
            }
        }
    }

    pub fn hello(&self, h: Hello) -> Result<Hello, LedgerError> {
        if h.proto_ver != PROTO_VER {
            return Err(LedgerError::VersionMismatch { got: h.proto_ver });
        }
        debug!(peer = %h.node_id, "hello");
        Ok(Hello {
            proto_ver: PROTO_VER,
            node_id: self.node_id.clone(),
            nonce: rand::random(),
        })
    }

    /// One key per owner. Re-registering the same key is acknowledged again.
    pub fn register_key(&mut self, r: RegisterKey) -> Result<RegisterAck, LedgerError> {
        match self.keys.get(&r.owner_id) {
            Some(existing) if *existing != r.public_key => {
                return Err(LedgerError::KeyAlreadyRegistered(r.owner_id));
            }
            Some(_) => {}
            None => {
                info!(owner = %r.owner_id, fingerprint = %r.public_key.fingerprint(), "registered public key");
                self.keys.insert(r.owner_id.clone(), r.public_key.clone());
            }
        }
        Ok(RegisterAck {
            fingerprint: r.public_key.fingerprint(),
            owner_id: r.owner_id,
        })
    }

    fn key_of(&self, owner_id: &str) -> Result<&PublicKey, LedgerError> {
        self.keys
            .get(owner_id)
            .ok_or_else(|| LedgerError::UnknownOwner(owner_id.to_string()))
    }

    pub fn submit_vehicle(&mut self, v: SubmitVehicle) -> Result<SubmitAck, LedgerError> {
        v.vehicle.validate(self.key_of(&v.owner_id)?)?;
        let entry = VehicleEntry {
            owner_id: v.owner_id,
            record: v.vehicle,
        };
        if let Some(existing) = self.vehicles.get(&v.vehicle_id) {
            if *existing != entry {
                return Err(LedgerError::Conflict(v.vehicle_id));
            }
        } else {
            info!(vehicle = %v.vehicle_id, owner = %entry.owner_id, "stored encrypted vehicle");
            self.vehicles.insert(v.vehicle_id.clone(), entry);
        }
        Ok(SubmitAck { id: v.vehicle_id })
    }

    pub fn submit_trip(&mut self, t: SubmitTrip) -> Result<SubmitAck, LedgerError> {
        let vehicle = self
            .vehicles
            .get(&t.vehicle_id)
            .ok_or_else(|| LedgerError::UnknownVehicle(t.vehicle_id.clone()))?;
        t.trip.validate(self.key_of(&vehicle.owner_id)?)?;
        let (year, month) = year_month(&t.date).ok_or_else(|| LedgerError::InvalidDate(t.date.clone()))?;
        let entry = TripEntry {
            vehicle_id: t.vehicle_id,
            date: t.date,
            year,
            month,
            record: t.trip,
        };
        if let Some(existing) = self.trips.get(&t.trip_id) {
            if *existing != entry {
                return Err(LedgerError::Conflict(t.trip_id));
            }
        } else {
            info!(trip = %t.trip_id, vehicle = %entry.vehicle_id, "stored encrypted trip");
            self.trips.insert(t.trip_id.clone(), entry);
        }
        Ok(SubmitAck { id: t.trip_id })
    }

    /// Price a trip and open the split-decryption round for it. Asking again
    /// for the same trip reopens the round with a freshly computed result.
    pub fn request_premium(&mut self, p: PremiumReq) -> Result<PremiumOffer, LedgerError> {
        let weights = self
            .criteria
            .get(&p.criteria_id)
            .ok_or_else(|| LedgerError::UnknownCriteria(p.criteria_id.clone()))?;
        let trip = self
            .trips
            .get(&p.trip_id)
            .ok_or_else(|| LedgerError::UnknownTrip(p.trip_id.clone()))?;
        if trip.vehicle_id != p.vehicle_id {
            return Err(LedgerError::TripVehicleMismatch {
                trip_id: p.trip_id,
                requested: p.vehicle_id,
                actual: trip.vehicle_id.clone(),
            });
        }
        let vehicle = self
            .vehicles
            .get(&trip.vehicle_id)
            .ok_or_else(|| LedgerError::UnknownVehicle(trip.vehicle_id.clone()))?;
        let pk = self.key_of(&vehicle.owner_id)?.clone();

        let premium = premium_encrypted(&pk, &vehicle.record, &trip.record, weights)?;
        let result_id = result_id_for(&p.trip_id);
        let request = self.rounds.open(result_id.clone(), &pk, premium.clone());
        self.offers.insert(
            result_id.clone(),
            OpenOffer {
                trip_id: p.trip_id.clone(),
            },
        );
        info!(%result_id, criteria = %p.criteria_id, "opened premium round");
        Ok(PremiumOffer {
            result_id,
            premium,
            request,
        })
    }

    /// Verify the owner's share, then commit the trip premium and fold it into
    /// the vehicle's monthly total.
    pub fn finalize(&mut self, s: ShareSubmit) -> Result<Finalized, LedgerError> {
        let result_id = s.share.result_id.clone();
        if !self.rounds.is_pending(&result_id) {
            if let Some((r_prime, done)) = self.closed.get(&result_id) {
                if *r_prime == s.share.r_prime {
                    debug!(%result_id, "share resent for a closed round");
                    return Ok(done.clone());
                }
            }
        }
        let trip_id = self
            .offers
            .get(&result_id)
            .map(|o| o.trip_id.clone())
            .ok_or_else(|| sdrivecrypto::Error::UnknownResult(result_id.clone()))?;
        let trip = self
            .trips
            .get(&trip_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownTrip(trip_id.clone()))?;
        let owner = self
            .vehicles
            .get(&trip.vehicle_id)
            .map(|v| v.owner_id.clone())
            .ok_or_else(|| LedgerError::UnknownVehicle(trip.vehicle_id.clone()))?;
        let n = self.key_of(&owner)?.n().clone();

        let residue = self.rounds.finalize(&s.share)?;
        self.offers.remove(&result_id);
        let premium = centered(residue, &n);

        let month_key = (trip.vehicle_id.clone(), trip.year, trip.month);
        let total = self.monthly.entry(month_key).or_default();
        if let Some(previous) = self.premiums.get(&trip_id) {
            *total -= &previous.premium;
        }
        *total += &premium;
        info!(%result_id, %premium, month_total = %total, "committed premium");

        self.premiums.insert(
            trip_id.clone(),
            CommittedPremium {
                trip_id,
                vehicle_id: trip.vehicle_id,
                date: trip.date,
                premium: premium.clone(),
            },
        );
        let done = Finalized { result_id, premium };
        self.closed
            .insert(done.result_id.clone(), (s.share.r_prime, done.clone()));
        Ok(done)
    }

    pub fn trip_premium(&self, trip_id: &str) -> Option<&CommittedPremium> {
        self.premiums.get(trip_id)
    }

    /// Sum of committed trip premiums for a vehicle in one calendar month.
    pub fn month_premium(&self, vehicle_id: &str, year: i32, month: u32) -> Option<&Integer> {
        self.monthly.get(&(vehicle_id.to_string(), year, month))
    }

    pub fn open_rounds(&self) -> usize {
        self.rounds.pending_len()
    }
}

// ------- Server loop -------

/// Accept connections until the endpoint closes. Each bidirectional stream
/// carries a sequence of request frames, each answered by one response frame.
pub async fn serve(endpoint: Endpoint, ledger: Arc<Mutex<Ledger>>) -> anyhow::Result<()> {
    while let Some(incoming) = endpoint.accept().await {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    debug!(peer = %conn.remote_address(), "new connection");
                    handle_connection(conn, ledger).await;
                }
                Err(e) => warn!(error = %e, "failed handshake"),
            }
        });
    }
    endpoint.wait_idle().await;
    Ok(())
}

async fn handle_connection(conn: quinn::Connection, ledger: Arc<Mutex<Ledger>>) {
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, ledger).await {
                        warn!(error = %e, "stream error");
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => break,
            Err(e) => {
                debug!(error = %e, "connection ended");
                break;
            }
        }
    }
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    ledger: Arc<Mutex<Ledger>>,
) -> Result<(), FrameError> {
    loop {
        let msg = match read_msg(&mut recv).await {
            Ok(m) => m,
            Err(FrameError::Closed) => break,
            Err(FrameError::Codec(e)) => {
                send_msg(&mut send, &Msg::rejected(format!("malformed frame: {e}"), false)).await?;
                break;
            }
            Err(e) => return Err(e),
        };
        debug!(request = msg.kind(), "recv");
        let reply = ledger.lock().await.handle(msg);
        send_msg(&mut send, &reply).await?;
    }
    // Already-finished streams are fine here.
    let _ = send.finish();
    Ok(())
}
