use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PokeError {
    #[error("invalid {0} {1:?}: must be non-empty and free of whitespace")]
    InvalidArgument(&'static str, String),
    #[error("dialing livemon: {0}")]
    Dial(io::Error),
    #[error("poking livemon: {0}")]
    Send(io::Error),
}

/// Report that `unit` finished with `status`, and wait until livemon has processed it.
///
/// The status is sent as given: livemon itself decides what a non-numeric one means.
pub async fn poke(socket: &Path, unit: &str, status: &str) -> Result<(), PokeError> {
    check_token("unit", unit)?;
    check_token("status", status)?;

    let mut conn = UnixStream::connect(socket).await.map_err(PokeError::Dial)?;
    conn.write_all(format!("{unit} {status}\n").as_bytes())
        .await
        .map_err(PokeError::Send)?;

    // Only used for blocking until livemon's finished
    let mut ack = Vec::new();
    if let Err(e) = conn.read_to_end(&mut ack).await {
        debug!("waiting for livemon: {}", e);
    }

    Ok(())
}

fn check_token(name: &'static str, value: &str) -> Result<(), PokeError> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(PokeError::InvalidArgument(name, value.to_owned()));
    }
    Ok(())
}
