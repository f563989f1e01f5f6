use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::metrics::LivenessMetrics;
use crate::state::{self, State, StateError, UnitRecord};
use crate::time::Clock;

/// The single source of truth for unit liveness.
///
/// The state map sits behind one lock, and the exported gauges are only written
/// while that lock is held, so a scrape never sees a label set that a concurrent
/// report is halfway through changing. Persistence also happens under the lock:
/// a save always carries every report applied before it.
pub struct Registry {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    metrics: Arc<LivenessMetrics>,
    state: Mutex<State>,
}

impl Registry {
    /// Load the state file at `path` (creating it if needed) and export its content.
    pub fn open(
        path: PathBuf,
        clock: Arc<dyn Clock>,
        metrics: Arc<LivenessMetrics>,
    ) -> Result<Self, StateError> {
        let state = state::load(&path, clock.as_ref())?;
        Ok(Self::new(state, path, clock, metrics))
    }

    pub fn new(
        state: State,
        path: PathBuf,
        clock: Arc<dyn Clock>,
        metrics: Arc<LivenessMetrics>,
    ) -> Self {
        // Exported values must not be empty between a restart and the next report
        metrics.refresh(&state);

        Self {
            path,
            clock,
            metrics,
            state: Mutex::new(state),
        }
    }

    /// Take the registry lock. Everything done through the guard is serialized
    /// with every other report.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            registry: self,
            state: self.state.lock().await,
        }
    }

    pub async fn snapshot(&self) -> State {
        self.state.lock().await.clone()
    }

    pub fn metrics(&self) -> &LivenessMetrics {
        &self.metrics
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct RegistryGuard<'a> {
    registry: &'a Registry,
    state: MutexGuard<'a, State>,
}

impl RegistryGuard<'_> {
    /// Note that `unit` ran. Unknown units are registered on their first report.
    pub fn record_report(&mut self, unit: &str, succeeded: bool) -> UnitRecord {
        let now = self.registry.clock.now();

        let record = self.state.units.entry(unit.to_owned()).or_default();
        record.last_touched = Some(now);
        if succeeded {
            record.last_success = Some(now);
        }

        record.clone()
    }

    pub fn refresh_metrics(&self) {
        self.registry.metrics.refresh(&self.state);
    }

    /// Write the whole state to disk. The in-memory state is kept as is if this fails.
    pub fn persist(&self) -> Result<(), StateError> {
        state::save(&self.registry.path, &self.state)
    }
}
