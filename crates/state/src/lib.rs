//! State persistence: pluggable storages sharing one key/path scheme,
//! with optimistic serial checking on write.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use metrics::{counter, histogram};
use tracing::debug;

use kusion_core::{Error, Result, State};

/// File name shared by the local and object-store layouts.
pub const STATE_FILE: &str = "state.yaml";

/// Table name used by database-backed storages.
pub const STATE_TABLE: &str = "state";

/// Persisted-state access keyed by `(project, stack, workspace)`.
///
/// `get` returns `None` when no snapshot exists; callers treat that as
/// an empty prior. `put` enforces `serial == prior.serial + 1` (an
/// absent prior counts as serial 0) and fails with `StaleState`
/// otherwise.
pub trait StateStorage: Send + Sync {
    fn get(&self, project: &str, stack: &str, workspace: &str) -> Result<Option<State>>;
    fn put(&self, state: &State) -> Result<()>;
    fn delete(&self, project: &str, stack: &str, workspace: &str) -> Result<()>;
}

/// Path of a state file under a local storage root.
pub fn state_file_path(dir: &Path, project: &str, stack: &str, workspace: &str) -> PathBuf {
    dir.join(project).join(stack).join(workspace).join(STATE_FILE)
}

/// Object key for OSS/S3 storages. A leading `/` in the prefix is
/// stripped; a single `/` is appended only when the prefix is non-empty.
pub fn object_store_state_key(prefix: &str, project: &str, stack: &str, workspace: &str) -> String {
    let prefix = prefix.strip_prefix('/').unwrap_or(prefix);
    if prefix.is_empty() {
        format!("{project}/{stack}/{workspace}/{STATE_FILE}")
    } else {
        format!("{prefix}/{project}/{stack}/{workspace}/{STATE_FILE}")
    }
}

fn check_serial(prior: Option<&State>, next: &State) -> Result<()> {
    let want = prior.map(|s| s.serial).unwrap_or(0) + 1;
    if next.serial != want {
        return Err(Error::StaleState {
            got: next.serial,
            want,
        });
    }
    Ok(())
}

/// Filesystem-backed storage. Writes go through a temp file and a
/// rename, so readers never observe a partial snapshot.
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalStorage { dir: dir.into() }
    }

    fn path(&self, project: &str, stack: &str, workspace: &str) -> PathBuf {
        state_file_path(&self.dir, project, stack, workspace)
    }
}

impl StateStorage for LocalStorage {
    fn get(&self, project: &str, stack: &str, workspace: &str) -> Result<Option<State>> {
        let started = std::time::Instant::now();
        let path = self.path(project, stack, workspace);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::RuntimeFailure {
                    id: path.display().to_string(),
                    message: format!("reading state file: {e}"),
                })
            }
        };
        let state: State = serde_yaml::from_str(&raw).map_err(|e| {
            Error::InvalidArgument(format!("parsing state file {}: {e}", path.display()))
        })?;
        histogram!("state_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Some(state))
    }

    fn put(&self, state: &State) -> Result<()> {
        let started = std::time::Instant::now();
        let prior = self.get(&state.project, &state.stack, &state.workspace)?;
        check_serial(prior.as_ref(), state)?;

        let path = self.path(&state.project, &state.stack, &state.workspace);
        let parent = path.parent().expect("state path always has a parent");
        std::fs::create_dir_all(parent).map_err(|e| Error::RuntimeFailure {
            id: parent.display().to_string(),
            message: format!("creating state dir: {e}"),
        })?;
        let yaml = serde_yaml::to_string(state)
            .map_err(|e| Error::InvalidArgument(format!("encoding state: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            Error::RuntimeFailure {
                id: parent.display().to_string(),
                message: format!("creating temp state file: {e}"),
            }
        })?;
        tmp.write_all(yaml.as_bytes())
            .and_then(|_| tmp.flush())
            .map_err(|e| Error::RuntimeFailure {
                id: path.display().to_string(),
                message: format!("writing state file: {e}"),
            })?;
        tmp.persist(&path).map_err(|e| Error::RuntimeFailure {
            id: path.display().to_string(),
            message: format!("renaming state file: {e}"),
        })?;

        debug!(path = %path.display(), serial = state.serial, "state written");
        histogram!("state_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("state_put_total", 1u64);
        Ok(())
    }

    fn delete(&self, project: &str, stack: &str, workspace: &str) -> Result<()> {
        let path = self.path(project, stack, workspace);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::RuntimeFailure {
                id: path.display().to_string(),
                message: format!("removing state file: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kusion_core::{build_id, Attributes, Resource, RuntimeType};

    fn state(serial: u64) -> State {
        let mut state = State::new("proj", "dev", "default", "jack");
        state.serial = serial;
        state.resources = vec![Resource {
            id: build_id("v1", "ConfigMap", "proj", "cm"),
            resource_type: RuntimeType::Kubernetes,
            attributes: Attributes::new(),
            depends_on: vec![],
            extensions: Attributes::new(),
        }];
        state
    }

    #[test]
    fn local_paths_follow_key_scheme() {
        let path = state_file_path(Path::new("/var/kusion"), "proj", "dev", "default");
        assert_eq!(
            path,
            PathBuf::from("/var/kusion/proj/dev/default/state.yaml")
        );
    }

    #[test]
    fn object_store_keys_normalise_prefix() {
        assert_eq!(
            object_store_state_key("", "p", "s", "w"),
            "p/s/w/state.yaml"
        );
        assert_eq!(
            object_store_state_key("/states", "p", "s", "w"),
            "states/p/s/w/state.yaml"
        );
        assert_eq!(
            object_store_state_key("states", "p", "s", "w"),
            "states/p/s/w/state.yaml"
        );
    }

    #[test]
    fn get_missing_state_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.get("proj", "dev", "default").unwrap().is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let state = state(1);
        storage.put(&state).unwrap();
        let loaded = storage.get("proj", "dev", "default").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn put_enforces_serial_monotonicity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        // First write must carry serial 1.
        let err = storage.put(&state(2)).unwrap_err();
        assert!(matches!(err, Error::StaleState { got: 2, want: 1 }));

        storage.put(&state(1)).unwrap();
        storage.put(&state(2)).unwrap();

        // Skipping a serial is stale, as is replaying one.
        let err = storage.put(&state(4)).unwrap_err();
        assert!(matches!(err, Error::StaleState { got: 4, want: 3 }));
        let err = storage.put(&state(2)).unwrap_err();
        assert!(matches!(err, Error::StaleState { got: 2, want: 3 }));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.put(&state(1)).unwrap();
        storage.delete("proj", "dev", "default").unwrap();
        storage.delete("proj", "dev", "default").unwrap();
        assert!(storage.get("proj", "dev", "default").unwrap().is_none());
    }
}
