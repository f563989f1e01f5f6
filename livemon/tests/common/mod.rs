#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::task::JoinHandle;

use livemon::access::{AccessGate, AllowAll};
use livemon::client::{poke, PokeError};
use livemon::control::bind_control_socket;
use livemon::metrics::LivenessMetrics;
use livemon::server::{serve, ServeError};
use livemon::state::State;
use livemon::time::SystemClock;
use livemon::Registry;

pub const STATE_FILE: &str = "livemon.state";

/// A livemon daemon running on real sockets, with its files in `dir`.
pub struct ServerHandle {
    pub http_addr: SocketAddr,
    pub socket: PathBuf,
    pub registry: Arc<Registry>,
    task: JoinHandle<ServeError>,
}

impl ServerHandle {
    pub async fn start(dir: &Path) -> Self {
        Self::start_with_gate(dir, Arc::new(AllowAll)).await
    }

    pub async fn start_with_gate(dir: &Path, gate: Arc<dyn AccessGate>) -> Self {
        let registry = Arc::new(
            Registry::open(
                dir.join(STATE_FILE),
                Arc::new(SystemClock::default()),
                Arc::new(LivenessMetrics::new()),
            )
            .expect("failed to load state"),
        );

        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind metrics listener");
        let http_addr = http_listener.local_addr().unwrap();
        let socket = dir.join("livemon.sock");
        let control_listener = bind_control_socket(&socket).expect("failed to bind control socket");

        let task = tokio::spawn(serve(
            http_listener,
            control_listener,
            registry.clone(),
            gate,
        ));

        Self {
            http_addr,
            socket,
            registry,
            task,
        }
    }

    pub async fn poke(&self, unit: &str, status: &str) -> Result<(), PokeError> {
        poke(&self.socket, unit, status).await
    }

    /// Write raw bytes on a control connection, then half-close it, and return what came
    /// back before the server closed its side.
    pub async fn send_raw(&self, request: &[u8]) -> Vec<u8> {
        let mut conn = UnixStream::connect(&self.socket).await.unwrap();
        conn.write_all(request).await.unwrap();
        conn.shutdown().await.ok();
        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        response
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::get(format!("http://{}{}", self.http_addr, path))
            .await
            .expect("failed to send request")
    }

    pub async fn scrape(&self) -> String {
        self.get("/metrics").await.text().await.unwrap()
    }

    pub async fn state(&self) -> State {
        self.registry.snapshot().await
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Value of `family{unit="<unit>"}` in a prometheus text exposition.
pub fn gauge(rendered: &str, family: &str, unit: &str) -> Option<f64> {
    let prefix = format!("{family}{{unit=\"{unit}\"}} ");
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().parse().expect("gauge value is a number"))
}
