use anyhow::Context;
use clap::Parser;
use sdrivecrypto::keys::{DEFAULT_PRIME_MAX, DEFAULT_PRIME_MIN};
use sdrivecrypto::{save_json, JsonFileKeyStore, KeyGenParams, KeyPair, KeyStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Opt {
    /// Output directory
    #[arg(long, default_value = "./keys")]
    out: String,
    /// Lower bound of the prime band (inclusive)
    #[arg(long, default_value_t = DEFAULT_PRIME_MIN)]
    min_prime: u64,
    /// Upper bound of the prime band (exclusive)
    #[arg(long, default_value_t = DEFAULT_PRIME_MAX)]
    max_prime: u64,
    /// Also store the secret in a key store directory under this owner id
    #[arg(long, requires = "store")]
    owner: Option<String>,
    #[arg(long)]
    store: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    let params = KeyGenParams {
        min: opt.min_prime,
        max: opt.max_prime,
    };
    let pair = KeyPair::generate_with(&params, &mut rand::rngs::OsRng)?;

    std::fs::create_dir_all(&opt.out).with_context(|| format!("creating {}", opt.out))?;
    save_json(format!("{}/paillier_pub.json", opt.out), &pair.public_key())?;
    save_json(format!("{}/paillier_priv.json", opt.out), &pair.secret())?;
    println!("Wrote Paillier keys to {}", opt.out);

    if let (Some(owner), Some(root)) = (opt.owner.as_deref(), opt.store.as_deref()) {
        JsonFileKeyStore::open(root)?
            .put(owner, &pair.secret())
            .with_context(|| format!("storing key for {owner}"))?;
        println!("Stored secret for {owner} in {root}");
    }
    println!("Public key fingerprint: {}", pair.public_key().fingerprint());
    Ok(())
}
