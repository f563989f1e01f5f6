use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::metrics::ReportOutcome;
use crate::registry::Registry;
use crate::state::{StateError, UnitRecord};

/// Exit status recorded when the reported one is not a number.
pub const INVALID_STATUS: i64 = 255;

const MAX_COMMAND_LEN: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("reading command: {0}")]
    Read(#[from] io::Error),
    #[error("connection closed before a full command line was received")]
    MissingNewline,
    #[error("invalid command string {0:?}")]
    Malformed(String),
    #[error("persisting state: {0}")]
    Persist(#[from] StateError),
}

/// A poke: `<unit> <status>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub unit: String,
    pub status: i64,
}

impl Command {
    /// Parse a command line. A status that is not an integer does not fail the command,
    /// it is recorded as [`INVALID_STATUS`] so that the beat itself is never lost.
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [unit, status] = fields[..] else {
            return Err(ControlError::Malformed(line.trim().to_owned()));
        };

        let status = match status.parse::<i64>() {
            Ok(status) => status,
            Err(e) => {
                warn!(unit, status, "invalid status, assuming failure: {}", e);
                INVALID_STATUS
            }
        };

        Ok(Self {
            unit: unit.to_owned(),
            status,
        })
    }

    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// An applied poke and the resulting unit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub command: Command,
    pub record: UnitRecord,
}

/// Source of control connections.
#[async_trait]
pub trait ControlListener: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept_next(&mut self) -> io::Result<Self::Conn>;
}

#[async_trait]
impl ControlListener for UnixListener {
    type Conn = UnixStream;

    async fn accept_next(&mut self) -> io::Result<UnixStream> {
        let (stream, _) = self.accept().await?;
        Ok(stream)
    }
}

/// Bind the control socket, replacing whatever a previous run left at `path`.
pub fn bind_control_socket(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accept control connections forever, handling each on its own task.
/// Only returns if accepting fails.
pub async fn serve_control<L: ControlListener>(
    mut listener: L,
    registry: Arc<Registry>,
) -> io::Result<()> {
    loop {
        let conn = listener.accept_next().await?;
        let registry = registry.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(&registry, conn).await {
                error!("handling client conn: {}", e);
            }
        });
    }
}

/// Process a single poke and close the connection. The client blocks on a read
/// until the close, which is its only acknowledgement: by then the report has
/// been applied and a save was attempted.
pub async fn handle_connection<S>(registry: &Registry, conn: S) -> Result<Report, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(conn);
    let result = apply(registry, &mut reader).await;

    registry.metrics().record_report(match &result {
        Ok(report) if report.command.succeeded() => ReportOutcome::Success,
        Ok(_) => ReportOutcome::Failure,
        Err(ControlError::Persist(_)) => ReportOutcome::PersistError,
        Err(_) => ReportOutcome::Malformed,
    });

    let mut conn = reader.into_inner();
    if let Err(e) = conn.shutdown().await {
        debug!("closing client conn: {}", e);
    }
    drop(conn);

    result
}

async fn apply<R>(registry: &Registry, reader: &mut R) -> Result<Report, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_command(reader).await?;
    let command = Command::parse(&line)?;

    let mut registry = registry.lock().await;
    let record = registry.record_report(&command.unit, command.succeeded());
    registry.refresh_metrics();
    info!(
        unit = %command.unit,
        status = command.status,
        success = command.succeeded(),
        "unit poked"
    );
    registry.persist()?;

    Ok(Report { command, record })
}

/// Read one newline-terminated line. Unit names are arbitrary bytes: anything that is
/// not UTF-8 is replaced rather than rejected, so the beat still counts.
async fn read_command<R>(reader: &mut R) -> Result<String, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    reader
        .take(MAX_COMMAND_LEN)
        .read_until(b'\n', &mut line)
        .await?;

    if line.last() != Some(&b'\n') {
        return Err(ControlError::MissingNewline);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
