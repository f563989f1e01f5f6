use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::access::AccessGate;
use crate::control::{serve_control, ControlListener};
use crate::registry::Registry;
use crate::router::router;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("metrics server failed: {0}")]
    Http(io::Error),
    #[error("metrics server exited")]
    HttpExited,
    #[error("control server failed: {0}")]
    Control(io::Error),
    #[error("control server exited")]
    ControlExited,
}

/// Serve metrics on `http_listener` and pokes on `control_listener` until either
/// of them fails. There is no degraded mode: the first failure ends both.
pub async fn serve<L: ControlListener>(
    http_listener: TcpListener,
    control_listener: L,
    registry: Arc<Registry>,
    gate: Arc<dyn AccessGate>,
) -> ServeError {
    let app = router(registry.clone(), gate);

    if let Ok(addr) = http_listener.local_addr() {
        info!("serving metrics on {}", addr);
    }

    let http = async move {
        axum::serve(
            http_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    };

    tokio::select! {
        res = http => match res {
            Ok(()) => ServeError::HttpExited,
            Err(e) => ServeError::Http(e),
        },
        res = serve_control(control_listener, registry) => match res {
            Ok(()) => ServeError::ControlExited,
            Err(e) => ServeError::Control(e),
        },
    }
}
