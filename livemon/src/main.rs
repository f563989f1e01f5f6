use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use livemon::access::{AccessGate, AllowAll, TailnetOnly};
use livemon::control::bind_control_socket;
use livemon::metrics::LivenessMetrics;
use livemon::server::serve;
use livemon::time::SystemClock;
use livemon::{Config, Registry};

async fn run(config: Config) -> Result<()> {
    if config.dev_mode {
        info!("running in dev mode");
    }

    let state_path = config.state_path()?;
    let socket_path = config.control_socket_path()?;

    let registry = Registry::open(
        state_path.clone(),
        Arc::new(SystemClock::default()),
        Arc::new(LivenessMetrics::new()),
    )
    .wrap_err("loading state")?;
    info!(
        path = %state_path.display(),
        units = registry.snapshot().await.units.len(),
        "state loaded"
    );

    let gate: Arc<dyn AccessGate> = if config.tailscale_only {
        info!("only serving metrics to tailnet peers");
        Arc::new(TailnetOnly)
    } else {
        Arc::new(AllowAll)
    };

    let bind = config.bind();
    let http_listener = TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("binding metrics listener on {bind}"))?;
    let control_listener = bind_control_socket(&socket_path)
        .wrap_err_with(|| format!("binding control socket {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "listening for pokes");

    Err(serve(http_listener, control_listener, Arc::new(registry), gate).await.into())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match Config::init_from_env() {
        Ok(config) => run(config).await,
        Err(e) => Err(e).wrap_err("failed to load configuration from env"),
    };

    if let Err(e) = result {
        error!("livemon exiting: {:?}", e);
        std::process::exit(1);
    }
}
