use envconfig::Envconfig;
use eyre::{bail, Result, WrapErr};
use tracing::error;
use tracing_subscriber::EnvFilter;

use livemon::client::poke;
use livemon::config::PokeConfig;

async fn run() -> Result<()> {
    let config = PokeConfig::init_from_env().wrap_err("failed to load configuration from env")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [unit, status] = args.as_slice() else {
        bail!("usage error, need 2 args: <unit> <status>");
    };

    poke(&config.socket, unit, status).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!("{:?}", e);
        std::process::exit(1);
    }
}
