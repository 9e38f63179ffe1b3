use anyhow::{bail, Context};
use clap::Parser;
use sdrivecrypto::{load_json, KeyPair, PublicKey, SecretKeyMaterial};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Opt {
    #[arg(long)]
    paillier_pub: String,
    #[arg(long)]
    paillier_priv: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    let raw = std::fs::read(&opt.paillier_pub).with_context(|| format!("reading {}", opt.paillier_pub))?;
    println!("Public key file blake3: {}", blake3::hash(&raw).to_hex());

    let pk: PublicKey = load_json(&opt.paillier_pub)?;
    println!("Public key fingerprint: {}", pk.fingerprint());

    if let Some(sk_path) = opt.paillier_priv {
        let secret: SecretKeyMaterial = load_json(&sk_path)?;
        let pair = KeyPair::from_secret(&secret).context("private key material is inconsistent")?;
        if pair.public_key() != pk {
            bail!("private key in {sk_path} does not match the public key");
        }
        println!("Private key file is well-formed and matches.");
    }
    Ok(())
}
