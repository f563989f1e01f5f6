use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::access::{Access, AccessGate};
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub gate: Arc<dyn AccessGate>,
}

pub fn router(registry: Arc<Registry>, gate: Arc<dyn AccessGate>) -> Router {
    let state = AppState { registry, gate };

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(state.clone(), access_gate))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "livemon"
}

async fn liveness() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> String {
    state.registry.metrics().render()
}

/// Every request goes through the access gate first. Peers we cannot identify are refused.
async fn access_gate(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let access = match peer {
        Some(addr) => state.gate.decide(addr).await,
        None => Access::Deny,
    };

    match access {
        Access::Allow => next.run(request).await,
        Access::Deny => {
            warn!(peer = ?peer, "access denied");
            (StatusCode::FORBIDDEN, "access denied").into_response()
        }
    }
}

/// Middleware to record some common HTTP metrics
async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();

    let path = if let Some(matched_path) = request.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        request.uri().path().to_owned()
    };

    let method = request.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(request).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    state
        .registry
        .metrics()
        .record_request(method.to_string(), path, status, latency);

    response
}
