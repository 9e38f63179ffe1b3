//! Data owner: holds the private key, encrypts records, answers premium
//! rounds and talks to the ledger over QUIC.

use std::net::SocketAddr;

use quinn::Endpoint;
use rand::{CryptoRng, RngCore};
use rug::Integer;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info};

use sdrivealgo::{centered, TripMetrics, VehicleAttributes};
use sdrivecrypto::store::load_decryptor;
use sdrivecrypto::{split, Decryptor, Encryptor, KeyGenParams, KeyPair, KeyStore, PublicKey};

use crate::retry::{CallError, RetryPolicy};
use crate::{
    make_client_config_with_root, read_msg, send_msg, Finalized, Hello, Msg, PremiumOffer, PremiumReq, RegisterAck,
    RegisterKey, ShareSubmit, SubmitAck, SubmitTrip, SubmitVehicle, LEDGER_SERVER_NAME, PROTO_VER,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum OfferError {
    #[error("offer for `{offer}` carries a request for `{request}`")]
    ResultIdMismatch { offer: String, request: String },
    #[error("blinding in the request for `{0}` was not derived from the offered ciphertext")]
    BlindingMismatch(String),
    #[error("ledger finalized `{result_id}` as {ledger}, local decryption gives {local}")]
    Disputed {
        result_id: String,
        ledger: Integer,
        local: Integer,
    },
    #[error(transparent)]
    Crypto(#[from] sdrivecrypto::Error),
}

/// What the owner learned from an offer and what it sends back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferAnswer {
    pub local_premium: Integer,
    pub submit: ShareSubmit,
}

#[derive(Debug)]
pub struct Owner {
    owner_id: String,
    decryptor: Decryptor,
    encryptor: Encryptor,
}

impl Owner {
    pub fn new(owner_id: impl Into<String>, decryptor: Decryptor) -> Self {
        let encryptor = Encryptor::new(decryptor.public_key());
        Self {
            owner_id: owner_id.into(),
            decryptor,
            encryptor,
        }
    }

    /// Load the owner's key from `store`.
    pub fn load(store: &dyn KeyStore, owner_id: &str) -> sdrivecrypto::Result<Self> {
        Ok(Self::new(owner_id, load_decryptor(store, owner_id)?))
    }

    /// Load the owner's key, generating and storing one on first use.
    pub fn provision<R: RngCore + CryptoRng>(
        store: &dyn KeyStore,
        owner_id: &str,
        params: &KeyGenParams,
        rng: &mut R,
    ) -> sdrivecrypto::Result<Self> {
        if let Some(secret) = store.get(owner_id)? {
            debug!(owner = owner_id, "using stored key");
            return Ok(Self::new(owner_id, Decryptor::from_secret(&secret)?));
        }
        let pair = KeyPair::generate_with(params, rng)?;
        store.put(owner_id, &pair.secret())?;
        info!(owner = owner_id, fingerprint = %pair.public_key().fingerprint(), "generated and stored a new key");
        Ok(Self::new(owner_id, Decryptor::new(pair)?))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.encryptor.public_key()
    }

    pub fn register_msg(&self) -> Msg {
        Msg::RegisterKey(RegisterKey {
            owner_id: self.owner_id.clone(),
            public_key: self.public_key().clone(),
        })
    }

    pub fn submit_vehicle_msg<R: RngCore + CryptoRng>(
        &self,
        vehicle_id: &str,
        vehicle: &VehicleAttributes,
        rng: &mut R,
    ) -> sdrivecrypto::Result<Msg> {
        Ok(Msg::SubmitVehicle(SubmitVehicle {
            owner_id: self.owner_id.clone(),
            vehicle_id: vehicle_id.to_string(),
            vehicle: vehicle.encrypt(&self.encryptor, rng)?,
        }))
    }

    pub fn submit_trip_msg<R: RngCore + CryptoRng>(
        &self,
        vehicle_id: &str,
        trip_id: &str,
        date: &str,
        trip: &TripMetrics,
        rng: &mut R,
    ) -> sdrivecrypto::Result<Msg> {
        Ok(Msg::SubmitTrip(SubmitTrip {
            vehicle_id: vehicle_id.to_string(),
            trip_id: trip_id.to_string(),
            date: date.to_string(),
            trip: trip.encrypt(&self.encryptor, rng)?,
        }))
    }

    /// Check an offer, decrypt the premium locally and derive the share that
    /// lets the ledger decrypt it too.
    pub fn answer_offer(&self, offer: &PremiumOffer) -> Result<OfferAnswer, OfferError> {
        if offer.request.result_id != offer.result_id {
            return Err(OfferError::ResultIdMismatch {
                offer: offer.result_id.clone(),
                request: offer.request.result_id.clone(),
            });
        }
        let share = split::respond(&self.decryptor, &offer.request)?;
        let pk = self.public_key();
        if split::blinding_for(pk, &offer.premium) != offer.request.blinding {
            return Err(OfferError::BlindingMismatch(offer.result_id.clone()));
        }
        let local_premium = centered(self.decryptor.decrypt(&offer.premium)?, pk.n());
        debug!(result_id = %offer.result_id, %local_premium, "answered premium offer");
        Ok(OfferAnswer {
            local_premium,
            submit: ShareSubmit { share },
        })
    }

    /// The ledger's verified value must agree with what the owner decrypted.
    pub fn confirm(&self, answer: &OfferAnswer, done: &Finalized) -> Result<(), OfferError> {
        if done.premium != answer.local_premium || done.result_id != answer.submit.share.result_id {
            return Err(OfferError::Disputed {
                result_id: done.result_id.clone(),
                ledger: done.premium.clone(),
                local: answer.local_premium.clone(),
            });
        }
        Ok(())
    }
}

fn unexpected(expected: &'static str, got: &Msg) -> CallError {
    CallError::Unexpected {
        expected,
        got: got.kind(),
    }
}

/// One QUIC connection to the ledger. Each call uses its own bidirectional
/// stream, so a retried call never reads a stale reply.
pub struct LedgerClient {
    endpoint: Endpoint,
    conn: quinn::Connection,
    policy: RetryPolicy,
}

impl LedgerClient {
    /// Dial the ledger, trusting only `ledger_cert`, and exchange hellos.
    pub async fn connect(
        peer: SocketAddr,
        ledger_cert: &CertificateDer<'static>,
        node_id: &str,
        policy: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(make_client_config_with_root(ledger_cert)?);
        let conn = endpoint.connect(peer, LEDGER_SERVER_NAME)?.await?;
        debug!(%peer, "connected to ledger");

        let client = Self {
            endpoint,
            conn,
            policy,
        };
        let hello = Msg::Hello(Hello {
            proto_ver: PROTO_VER,
            node_id: node_id.to_string(),
            nonce: rand::random(),
        });
        match client.request("hello", hello).await? {
            Msg::Hello(h) => info!(ledger = %h.node_id, "ledger accepted hello"),
            other => return Err(unexpected("Hello", &other).into()),
        }
        Ok(client)
    }

    /// One request/response exchange, without retries. A `Rejected` reply
    /// comes back as an error.
    pub async fn call(&self, msg: &Msg) -> Result<Msg, CallError> {
        let (mut send, mut recv) = self.conn.open_bi().await?;
        send_msg(&mut send, msg).await?;
        let _ = send.finish();
        match read_msg(&mut recv).await? {
            Msg::Rejected(r) => Err(CallError::Rejected {
                reason: r.reason,
                retryable: r.retryable,
            }),
            reply => Ok(reply),
        }
    }

    /// [`LedgerClient::call`] under the client's retry policy.
    pub async fn request(&self, what: &str, msg: Msg) -> Result<Msg, CallError> {
        let this = self;
        let msg = &msg;
        self.policy.run(what, move || this.call(msg)).await
    }

    pub async fn register(&self, owner: &Owner) -> Result<RegisterAck, CallError> {
        match self.request("register", owner.register_msg()).await? {
            Msg::RegisterAck(ack) => Ok(ack),
            other => Err(unexpected("RegisterAck", &other)),
        }
    }

    /// Submit an already encrypted vehicle or trip record.
    pub async fn submit(&self, msg: Msg) -> Result<SubmitAck, CallError> {
        match self.request(msg.kind(), msg).await? {
            Msg::SubmitAck(ack) => Ok(ack),
            other => Err(unexpected("SubmitAck", &other)),
        }
    }

    /// Run one full premium round for a trip and return the agreed premium.
    pub async fn price_trip(&self, owner: &Owner, req: PremiumReq) -> Result<Finalized, CallError> {
        let offer = match self.request("premium", Msg::PremiumReq(req)).await? {
            Msg::PremiumOffer(offer) => offer,
            other => return Err(unexpected("PremiumOffer", &other)),
        };
        let answer = owner.answer_offer(&offer)?;
        let done = match self.request("share", Msg::ShareSubmit(answer.submit.clone())).await? {
            Msg::Finalized(done) => done,
            other => return Err(unexpected("Finalized", &other)),
        };
        owner.confirm(&answer, &done)?;
        info!(result_id = %done.result_id, premium = %done.premium, "premium finalized");
        Ok(done)
    }

    pub async fn close(self) {
        self.conn.close(0u32.into(), b"bye");
        self.endpoint.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use sdrivealgo::{premium_encrypted, CriteriaWeights};
    use sdrivecrypto::{MemoryKeyStore, SplitCoordinator};

    fn small() -> KeyGenParams {
        KeyGenParams::default()
    }

    fn offer_for(owner: &Owner, premium: i64) -> (PremiumOffer, SplitCoordinator) {
        let pk = owner.public_key().clone();
        let enc = Encryptor::new(pk.clone());
        let vehicle = VehicleAttributes {
            vehicle_type: 0,
            purchase_mileage: 0,
            year: 0,
        }
        .encrypt(&enc, &mut OsRng)
        .unwrap();
        let trip = TripMetrics {
            mileage: premium as u64,
            ..TripMetrics::default()
        }
        .encrypt(&enc, &mut OsRng)
        .unwrap();
        let weights = CriteriaWeights {
            alpha: 1,
            ..CriteriaWeights::default()
        };
        let c = premium_encrypted(&pk, &vehicle, &trip, &weights).unwrap();
        let mut rounds = SplitCoordinator::new();
        let request = rounds.open("result_t1", &pk, c.clone());
        (
            PremiumOffer {
                result_id: "result_t1".into(),
                premium: c,
                request,
            },
            rounds,
        )
    }

    #[test]
    fn provision_generates_once() {
        let store = MemoryKeyStore::new();
        let first = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();
        let second = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(Owner::load(&store, "o1").unwrap().public_key(), first.public_key());
        assert!(matches!(
            Owner::load(&store, "o2"),
            Err(sdrivecrypto::Error::MissingKeyMaterial(_))
        ));
    }

    #[test]
    fn answered_offer_closes_the_round() {
        let store = MemoryKeyStore::new();
        let owner = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();
        let (offer, mut rounds) = offer_for(&owner, 812);
        let answer = owner.answer_offer(&offer).unwrap();
        assert_eq!(answer.local_premium, 812);
        assert_eq!(rounds.finalize(&answer.submit.share).unwrap(), 812);
        let done = Finalized {
            result_id: "result_t1".into(),
            premium: Integer::from(812),
        };
        assert!(owner.confirm(&answer, &done).is_ok());
    }

    #[test]
    fn inconsistent_offers_are_refused() {
        let store = MemoryKeyStore::new();
        let owner = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();

        let (mut offer, _) = offer_for(&owner, 10);
        offer.request.result_id = "result_t2".into();
        assert!(matches!(
            owner.answer_offer(&offer),
            Err(OfferError::ResultIdMismatch { .. })
        ));

        let (mut offer, _) = offer_for(&owner, 10);
        offer.request.blinding += 1;
        assert_eq!(
            owner.answer_offer(&offer),
            Err(OfferError::BlindingMismatch("result_t1".into()))
        );

        let (mut offer, _) = offer_for(&owner, 10);
        offer.request.key_fingerprint = "00".repeat(32);
        assert!(matches!(
            owner.answer_offer(&offer),
            Err(OfferError::Crypto(sdrivecrypto::Error::KeyMismatch { .. }))
        ));
    }

    #[test]
    fn disagreeing_ledger_is_disputed() {
        let store = MemoryKeyStore::new();
        let owner = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();
        let (offer, _) = offer_for(&owner, 40);
        let answer = owner.answer_offer(&offer).unwrap();
        let done = Finalized {
            result_id: "result_t1".into(),
            premium: Integer::from(41),
        };
        assert!(matches!(owner.confirm(&answer, &done), Err(OfferError::Disputed { .. })));
    }

    #[test]
    fn submissions_are_encrypted_under_the_owner_key() {
        let store = MemoryKeyStore::new();
        let owner = Owner::provision(&store, "o1", &small(), &mut OsRng).unwrap();
        let msg = owner
            .submit_trip_msg("v1", "t1", "2024-05-03", &TripMetrics::default(), &mut OsRng)
            .unwrap();
        match msg {
            Msg::SubmitTrip(t) => {
                assert_eq!(t.trip_id, "t1");
                assert!(t.trip.validate(owner.public_key()).is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(owner.register_msg(), Msg::RegisterKey(r) if r.owner_id == "o1"));
    }
}
