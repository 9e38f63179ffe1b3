// Owner node: manages the owner's key, submits encrypted records and
// answers premium rounds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rustls::pki_types::CertificateDer;
use serde::de::DeserializeOwned;

use sdrivealgo::{TripMetrics, VehicleAttributes};
use sdrivecrypto::keys::{DEFAULT_PRIME_MAX, DEFAULT_PRIME_MIN};
use sdrivecrypto::{JsonFileKeyStore, KeyGenParams};
use sdrivenode::config::{default_key_store_dir, NodeConfig};
use sdrivenode::owner::{LedgerClient, Owner};
use sdrivenode::{init_tracing, PremiumReq};

#[derive(Debug, Parser)]
struct Opt {
    /// Node configuration (TOML). Defaults to ~/.securedrive/node.toml if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ledger QUIC address, e.g. 127.0.0.1:9000
    #[arg(long, global = true)]
    peer: Option<SocketAddr>,

    /// Ledger certificate (DER), as written by `ledger --cert-out`
    #[arg(long, global = true)]
    ledger_cert: Option<PathBuf>,

    /// Key store directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[arg(long, global = true)]
    owner_id: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Generate and store a key for this owner unless one exists
    Keygen {
        #[arg(long, default_value_t = DEFAULT_PRIME_MIN)]
        min_prime: u64,
        #[arg(long, default_value_t = DEFAULT_PRIME_MAX)]
        max_prime: u64,
    },
    /// Register the owner's public key with the ledger
    Register,
    /// Encrypt and submit vehicle attributes read from a JSON file
    SubmitVehicle {
        #[arg(long)]
        vehicle_id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Encrypt and submit trip metrics read from a JSON file
    SubmitTrip {
        #[arg(long)]
        vehicle_id: String,
        #[arg(long)]
        trip_id: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Price a trip and take part in decrypting the result
    Premium {
        #[arg(long)]
        vehicle_id: String,
        #[arg(long)]
        trip_id: String,
        #[arg(long, default_value = "standard")]
        criteria: String,
    },
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_reader(f).with_context(|| format!("parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let opt = Opt::parse();
    let cfg = NodeConfig::load(&opt.config)?;

    let owner_id = opt
        .owner_id
        .or(cfg.owner.owner_id)
        .ok_or_else(|| anyhow!("no owner id: pass --owner-id or set owner.owner_id"))?;
    let store_dir = opt
        .store
        .or(cfg.owner.key_store)
        .or_else(default_key_store_dir)
        .ok_or_else(|| anyhow!("no key store directory: pass --store"))?;
    let store = JsonFileKeyStore::open(&store_dir)?;

    if let Cmd::Keygen { min_prime, max_prime } = opt.cmd {
        let params = KeyGenParams {
            min: min_prime,
            max: max_prime,
        };
        let owner = Owner::provision(&store, &owner_id, &params, &mut OsRng)?;
        println!("{} {}", owner.owner_id(), owner.public_key().fingerprint());
        return Ok(());
    }

    let owner = Owner::load(&store, &owner_id)
        .with_context(|| format!("load key for {owner_id} from {}", store_dir.display()))?;

    let peer = match opt.peer.or(cfg.owner.peer) {
        Some(addr) => addr,
        None => "127.0.0.1:9000".parse()?,
    };
    let cert_path = opt
        .ledger_cert
        .or(cfg.owner.ledger_cert)
        .ok_or_else(|| anyhow!("no ledger certificate: pass --ledger-cert"))?;
    let der = std::fs::read(&cert_path).with_context(|| format!("read ledger cert {}", cert_path.display()))?;
    let cert = CertificateDer::from(der);

    let client = LedgerClient::connect(peer, &cert, &owner_id, cfg.retry.policy()).await?;
    let outcome = run(&client, &owner, opt.cmd).await;
    client.close().await;
    outcome
}

async fn run(client: &LedgerClient, owner: &Owner, cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Keygen { .. } => {}
        Cmd::Register => {
            let ack = client.register(owner).await?;
            println!("registered {} {}", ack.owner_id, ack.fingerprint);
        }
        Cmd::SubmitVehicle { vehicle_id, file } => {
            let vehicle: VehicleAttributes = read_record(&file)?;
            let msg = owner.submit_vehicle_msg(&vehicle_id, &vehicle, &mut OsRng)?;
            println!("stored vehicle {}", client.submit(msg).await?.id);
        }
        Cmd::SubmitTrip {
            vehicle_id,
            trip_id,
            date,
            file,
        } => {
            let trip: TripMetrics = read_record(&file)?;
            let msg = owner.submit_trip_msg(&vehicle_id, &trip_id, &date, &trip, &mut OsRng)?;
            println!("stored trip {}", client.submit(msg).await?.id);
        }
        Cmd::Premium {
            vehicle_id,
            trip_id,
            criteria,
        } => {
            let req = PremiumReq {
                vehicle_id,
                trip_id,
                criteria_id: criteria,
            };
            let done = client.price_trip(owner, req).await?;
            println!("{} {}", done.result_id, done.premium);
        }
    }
    Ok(())
}
