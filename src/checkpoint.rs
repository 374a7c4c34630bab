//! Save and restore the full simulator state.
//!
//! A checkpoint is a copy of the simulator's `data` directory taken while the process
//! is stopped. Restoring replaces that directory wholesale and restarts the process on
//! the same ports, so nothing written after the checkpoint survives.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::Instant,
};

use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    error::{CheckpointError, ErrorKind, ProcessError},
    supervisor::{DATA_DIR, HandleId, LifecycleState, SimulatorHandle, Supervisor},
};

/// Opaque reference to a captured simulator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    id: u64,
    label: String,
    handle: HandleId,
}

impl Checkpoint {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The simulator instance that produced this checkpoint.
    pub fn handle_id(&self) -> &HandleId {
        &self.handle
    }
}

/// Keeps the checkpoints of one session in a temporary directory that is removed with
/// the manager.
#[derive(Debug)]
pub struct CheckpointManager {
    root: TempDir,
    next_id: u64,
    entries: HashMap<u64, PathBuf>,
}

impl CheckpointManager {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            root: tempfile::Builder::new().prefix("near-testbed-checkpoints-").tempdir()?,
            next_id: 0,
            entries: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Captures the current state of `handle`. The simulator is briefly stopped and
    /// restarted on the same endpoint.
    pub async fn snapshot(
        &mut self,
        supervisor: &Supervisor,
        handle: &mut SimulatorHandle,
        label: &str,
    ) -> Result<Checkpoint, ErrorKind> {
        let home = managed_home(handle)?;
        if handle.state() != LifecycleState::Ready {
            return Err(ProcessError::NotReady { state: handle.state() }.into());
        }

        let started = Instant::now();
        let id = self.next_id;
        let target = self.root.path().join(id.to_string());

        supervisor.stop(handle).await;
        let copied = copy_dir(&home.join(DATA_DIR), &target.join(DATA_DIR));
        // The simulator comes back whether or not the copy worked.
        supervisor.relaunch(handle).await?;
        if let Err(err) = copied {
            let _ = fs::remove_dir_all(&target);
            return Err(CheckpointError::CaptureFailed(err).into());
        }

        self.next_id += 1;
        self.entries.insert(id, target);
        info!(checkpoint = label, id, elapsed = ?started.elapsed(), "Captured checkpoint");
        Ok(Checkpoint {
            id,
            label: label.to_string(),
            handle: handle.id().clone(),
        })
    }

    /// Puts `handle` back into exactly the state captured by `checkpoint`.
    ///
    /// On failure the handle is marked [`LifecycleState::Failed`]; the session should be
    /// reset to genesis or discarded.
    pub async fn restore(
        &self,
        supervisor: &Supervisor,
        handle: &mut SimulatorHandle,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let home = managed_home(handle)?;
        if checkpoint.handle != *handle.id() {
            return Err(CheckpointError::Foreign {
                label: checkpoint.label.clone(),
                owner: checkpoint.handle.to_string(),
                current: handle.id().to_string(),
            });
        }
        let source = self
            .entries
            .get(&checkpoint.id)
            .ok_or_else(|| CheckpointError::Unknown(checkpoint.label.clone()))?;
        if handle.state() == LifecycleState::Failed {
            return Err(CheckpointError::RestoreFailed {
                reason: "sandbox already failed".to_string(),
            });
        }

        let started = Instant::now();
        supervisor.stop(handle).await;
        let result = replace_dir(source.join(DATA_DIR).as_path(), &home.join(DATA_DIR))
            .map_err(|err| err.to_string());
        let result = match result {
            Ok(()) => supervisor.relaunch(handle).await.map_err(|err| err.to_string()),
            Err(reason) => Err(reason),
        };

        match result {
            Ok(()) => {
                debug!(checkpoint = %checkpoint.label, elapsed = ?started.elapsed(), "Restored checkpoint");
                Ok(())
            }
            Err(reason) => {
                warn!(checkpoint = %checkpoint.label, %reason, "Restore failed");
                supervisor.stop(handle).await;
                handle.set_state(LifecycleState::Failed);
                Err(CheckpointError::RestoreFailed { reason })
            }
        }
    }
}

fn managed_home(handle: &SimulatorHandle) -> Result<PathBuf, CheckpointError> {
    handle
        .home_dir()
        .map(Path::to_path_buf)
        .ok_or(CheckpointError::Unsupported)
}

/// Recursively copies `from` into a new directory `to`.
fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replaces `to` with a copy of `from`, leaving nothing of the old contents behind.
fn replace_dir(from: &Path, to: &Path) -> io::Result<()> {
    match fs::remove_dir_all(to) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    copy_dir(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_copy_dir_is_recursive() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("data");
        write(&from.join("CURRENT"), "MANIFEST-000001");
        write(&from.join("col/000004.sst"), "rows");

        let to = dir.path().join("copy");
        copy_dir(&from, &to).unwrap();
        assert_eq!(fs::read_to_string(to.join("CURRENT")).unwrap(), "MANIFEST-000001");
        assert_eq!(fs::read_to_string(to.join("col/000004.sst")).unwrap(), "rows");
    }

    #[test]
    fn test_replace_dir_drops_newer_files() {
        let dir = TempDir::new().unwrap();
        let saved = dir.path().join("saved");
        write(&saved.join("CURRENT"), "old");

        let live = dir.path().join("live");
        write(&live.join("CURRENT"), "new");
        write(&live.join("000009.log"), "written after the checkpoint");

        replace_dir(&saved, &live).unwrap();
        assert_eq!(fs::read_to_string(live.join("CURRENT")).unwrap(), "old");
        assert!(!live.join("000009.log").exists());
    }

    #[test]
    fn test_replace_into_missing_dir() {
        let dir = TempDir::new().unwrap();
        let saved = dir.path().join("saved");
        write(&saved.join("CURRENT"), "old");

        let live = dir.path().join("live");
        replace_dir(&saved, &live).unwrap();
        assert!(live.join("CURRENT").exists());
    }

    #[test]
    fn test_copy_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        assert!(copy_dir(&dir.path().join("absent"), &dir.path().join("copy")).is_err());
    }

    #[tokio::test]
    async fn test_attached_handles_do_not_support_checkpoints() {
        let mut manager = CheckpointManager::new().unwrap();
        let supervisor = Supervisor::new(Default::default());
        let mut handle = SimulatorHandle::attached("http://127.0.0.1:1".parse().unwrap());

        let err = manager.snapshot(&supervisor, &mut handle, "baseline").await.unwrap_err();
        assert!(matches!(err, ErrorKind::Checkpoint(CheckpointError::Unsupported)));
        assert!(manager.is_empty());
    }

    fn unmanaged_handle(home: &Path) -> SimulatorHandle {
        SimulatorHandle::with_home("http://127.0.0.1:1".parse().unwrap(), home.to_path_buf())
    }

    #[tokio::test]
    async fn test_foreign_checkpoint_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new().unwrap();
        let supervisor = Supervisor::new(Default::default());
        let mut handle = unmanaged_handle(dir.path());
        let other = unmanaged_handle(dir.path());
        let checkpoint = Checkpoint {
            id: 0,
            label: "baseline".to_string(),
            handle: other.id().clone(),
        };

        let err = manager.restore(&supervisor, &mut handle, &checkpoint).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Foreign { ref label, .. } if label == "baseline"));
        assert_eq!(handle.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_checkpoint_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new().unwrap();
        let supervisor = Supervisor::new(Default::default());
        let mut handle = unmanaged_handle(dir.path());
        let checkpoint = Checkpoint {
            id: 41,
            label: "elsewhere".to_string(),
            handle: handle.id().clone(),
        };

        let err = manager.restore(&supervisor, &mut handle, &checkpoint).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_failed_handle_cannot_be_restored() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new().unwrap();
        let supervisor = Supervisor::new(Default::default());
        let mut handle = unmanaged_handle(dir.path());
        manager.entries.insert(0, manager.root.path().join("0"));
        let checkpoint = Checkpoint {
            id: 0,
            label: "baseline".to_string(),
            handle: handle.id().clone(),
        };
        handle.set_state(LifecycleState::Failed);

        let err = manager.restore(&supervisor, &mut handle, &checkpoint).await.unwrap_err();
        assert!(matches!(err, CheckpointError::RestoreFailed { .. }));
    }

    #[tokio::test]
    async fn test_restore_failure_marks_handle_failed() {
        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new().unwrap();
        // Points at a binary that does not exist, so the relaunch after the copy fails.
        let supervisor = Supervisor::new(crate::config::SandboxConfig::default().with_binary(dir.path().join("no-such-binary")));
        let mut handle = unmanaged_handle(dir.path());
        let saved = manager.root.path().join("0");
        write(&saved.join(DATA_DIR).join("CURRENT"), "old");
        manager.entries.insert(0, saved);
        let checkpoint = Checkpoint {
            id: 0,
            label: "baseline".to_string(),
            handle: handle.id().clone(),
        };

        let err = manager.restore(&supervisor, &mut handle, &checkpoint).await.unwrap_err();
        assert!(matches!(err, CheckpointError::RestoreFailed { .. }));
        assert_eq!(handle.state(), LifecycleState::Failed);
        assert_eq!(
            fs::read_to_string(dir.path().join(DATA_DIR).join("CURRENT")).unwrap(),
            "old"
        );
    }
}
