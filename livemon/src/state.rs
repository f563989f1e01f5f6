use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::time::Clock;

const STATE_FILE_MODE: u32 = 0o600;

/// Liveness of a single unit. `None` means the event never happened.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRecord {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_touched: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

/// Everything livemon knows, as written to the state file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// When the state was first made, never updated afterwards
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(default)]
    pub units: BTreeMap<String, UnitRecord>,
}

impl State {
    pub fn new(created: OffsetDateTime) -> Self {
        Self {
            created,
            units: BTreeMap::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("reading state from {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("decoding state from {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing state to {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Read the state file at `path`. If there is none yet, a fresh state is created
/// and written out before being returned.
pub fn load(path: &Path, clock: &dyn Clock) -> Result<State, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let state = State::new(clock.now());
            save(path, &state)?;
            info!(path = %path.display(), "created initial state");
            return Ok(state);
        }
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_owned(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
        path: path.to_owned(),
        source,
    })
}

pub fn save(path: &Path, state: &State) -> Result<(), StateError> {
    let bytes = serde_json::to_vec(state)?;

    atomic_write(path, &bytes).map_err(|source| StateError::Write {
        path: path.to_owned(),
        source,
    })
}

// Readers only ever see the old or the new file: the content goes to a sibling
// temp file which is renamed over the target once synced. Any early return drops
// the temp file, which deletes it.
fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    replace_file(path, content, |dir| File::open(dir)?.sync_all())
}

/// Write `content` next to `path` and rename it over `path`. Once the rename happened
/// the new content is in place, so a failing directory sync is only logged.
fn replace_file<F>(path: &Path, content: &[u8], sync_dir: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".livemon")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(STATE_FILE_MODE))?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    if let Err(e) = sync_dir(dir) {
        warn!(dir = %dir.display(), "syncing state directory: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use time::macros::datetime;
    use tracing_test::traced_test;

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "tmp"))
            .collect()
    }

    fn sample_state() -> State {
        let mut state = State::new(datetime!(2024-01-01 00:00:00 UTC));
        state.units.insert(
            "build-nightly".to_owned(),
            UnitRecord {
                last_touched: Some(datetime!(2024-03-02 04:05:06.123456789 UTC)),
                last_success: Some(datetime!(2024-03-01 04:05:06 UTC)),
            },
        );
        state.units.insert(
            "flaky-job".to_owned(),
            UnitRecord {
                last_touched: Some(datetime!(2024-03-02 10:00:00 UTC)),
                last_success: None,
            },
        );
        state
    }

    #[test]
    fn load_creates_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        let clock = ManualClock::new(datetime!(2024-05-06 07:08:09 UTC));

        let state = load(&path, &clock).unwrap();

        assert_eq!(state, State::new(datetime!(2024-05-06 07:08:09 UTC)));
        assert!(path.exists(), "initial state is persisted immediately");

        // A second load reads the file back instead of making a new state
        clock.advance(time::Duration::hours(1));
        assert_eq!(load(&path, &clock).unwrap(), state);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        let clock = ManualClock::new(datetime!(2030-01-01 00:00:00 UTC));
        let state = sample_state();

        save(&path, &state).unwrap();

        assert_eq!(load(&path, &clock).unwrap(), state);
    }

    #[test]
    fn file_format_keeps_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");

        save(&path, &sample_state()).unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_json_eq!(
            written,
            json!({
                "created": "2024-01-01T00:00:00Z",
                "units": {
                    "build-nightly": {
                        "lastTouched": "2024-03-02T04:05:06.123456789Z",
                        "lastSuccess": "2024-03-01T04:05:06Z",
                    },
                    "flaky-job": {
                        "lastTouched": "2024-03-02T10:00:00Z",
                        "lastSuccess": null,
                    },
                },
            })
        );
    }

    #[test]
    fn missing_fields_decode_as_never() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        fs::write(
            &path,
            r#"{"created":"2024-01-01T00:00:00Z","units":{"a":{}}}"#,
        )
        .unwrap();
        let clock = ManualClock::new(datetime!(2030-01-01 00:00:00 UTC));

        let state = load(&path, &clock).unwrap();

        assert_eq!(state.units.get("a"), Some(&UnitRecord::default()));
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        let clock = ManualClock::new(datetime!(2030-01-01 00:00:00 UTC));

        let full = serde_json::to_vec(&sample_state()).unwrap();
        for content in [&b""[..], &b"not json"[..], &full[..full.len() / 2]] {
            fs::write(&path, content).unwrap();
            let err = load(&path, &clock).unwrap_err();
            assert!(matches!(err, StateError::Decode { .. }), "got {err:?}");
        }
    }

    #[test]
    fn save_is_private_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");

        save(&path, &sample_state()).unwrap();
        save(&path, &State::new(datetime!(2024-01-01 00:00:00 UTC))).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn interrupted_save_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        let clock = ManualClock::new(datetime!(2030-01-01 00:00:00 UTC));
        let state = sample_state();
        save(&path, &state).unwrap();

        // What a crash between writing the temp file and renaming it leaves behind
        let full = serde_json::to_vec(&State::new(clock.now())).unwrap();
        fs::write(
            dir.path().join(".livemonAbC123.tmp"),
            &full[..full.len() / 3],
        )
        .unwrap();

        assert_eq!(load(&path, &clock).unwrap(), state);
    }

    #[test]
    fn failed_save_does_not_touch_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("livemon.state");

        let err = save(&path, &sample_state()).unwrap_err();

        assert!(matches!(err, StateError::Write { .. }), "got {err:?}");
        assert!(!path.exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    #[traced_test]
    fn directory_sync_failure_after_rename_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livemon.state");
        fs::write(&path, b"old").unwrap();

        let result = replace_file(&path, b"new", |_| {
            Err(io::Error::new(io::ErrorKind::Other, "fsync refused"))
        });

        assert!(result.is_ok(), "got {result:?}");
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(temp_files(dir.path()).is_empty());
        assert!(logs_contain("syncing state directory"));
    }
}
