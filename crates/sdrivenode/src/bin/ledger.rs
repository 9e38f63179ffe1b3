// Ledger node: stores encrypted records, prices trips homomorphically and
// closes split-decryption rounds with the owner's shares.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quinn::Endpoint;
use tokio::sync::Mutex;
use tracing::{info, warn};

use sdrivenode::config::NodeConfig;
use sdrivenode::ledger::{serve, Ledger};
use sdrivenode::{init_tracing, make_server_config_self_signed, LEDGER_SERVER_NAME};

#[derive(Debug, Parser)]
struct Opt {
    /// Node configuration (TOML). Defaults to ~/.securedrive/node.toml if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Write the self-signed certificate (DER) here so owners can pin it
    #[arg(long)]
    cert_out: Option<PathBuf>,

    /// Name the ledger reports in its hello
    #[arg(long, default_value = "ledger")]
    node_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let opt = Opt::parse();
    let cfg = NodeConfig::load(&opt.config)?;

    let listen = match opt.listen.or(cfg.ledger.listen) {
        Some(addr) => addr,
        None => "0.0.0.0:9000".parse()?,
    };
    let cert_out = opt.cert_out.or(cfg.ledger.cert_out);
    if cfg.ledger.criteria.is_empty() {
        warn!("no criteria weights configured; every premium request will be rejected");
    }

    let (server_cfg, cert_der) = make_server_config_self_signed(LEDGER_SERVER_NAME)?;
    if let Some(path) = &cert_out {
        std::fs::write(path, cert_der.as_ref()).with_context(|| format!("write cert {}", path.display()))?;
        info!(path = %path.display(), "wrote DER certificate");
    }

    let endpoint = Endpoint::server(server_cfg, listen)?;
    info!(%listen, criteria = cfg.ledger.criteria.len(), "ledger listening");

    let ledger = Arc::new(Mutex::new(Ledger::new(opt.node_id, cfg.ledger.criteria)));
    serve(endpoint, ledger).await
}
