//! Workspace management
//!
//! Each run gets its own freshly created directory under the workspace root.
//! Directories are never pooled or reused: the name embeds a new workspace id
//! on every acquire, and task executors read and write inside it without
//! further locking.
//!
//! ```text
//! <root>/
//! ├── 1b4e28ba-...-<workspace id>/   run A
//! │   ├── src/                       clone output, build context
//! │   └── auth.json                  registry login, gone on release
//! └── 6fa459ea-...-<workspace id>/   run B
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no workspace capacity left ({capacity} in use)")]
    Exhausted { capacity: usize },

    #[error("run {0} already holds a workspace")]
    AlreadyBound(Uuid),

    #[error("workspace I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle to a directory bound to exactly one run
///
/// Not `Clone`: releasing consumes the handle.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    run_id: Uuid,
    path: PathBuf,
}

impl Workspace {
    #[cfg(test)]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[cfg(test)]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the source tree is cloned into
    pub fn source_dir(&self) -> PathBuf {
        self.path.join("src")
    }
}

/// Allocates and reclaims per-run workspaces
pub struct WorkspaceManager {
    root: PathBuf,
    capacity: usize,
    /// workspace id -> run id
    active: Mutex<HashMap<Uuid, Uuid>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity,
            active: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of workspaces currently bound to runs
    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    /// Allocates a fresh, empty directory bound to `run_id`
    pub async fn acquire(&self, run_id: Uuid) -> Result<Workspace, WorkspaceError> {
        let id = {
            let mut active = self.active();
            if active.len() >= self.capacity {
                return Err(WorkspaceError::Exhausted {
                    capacity: self.capacity,
                });
            }
            if active.values().any(|bound| *bound == run_id) {
                return Err(WorkspaceError::AlreadyBound(run_id));
            }
            let id = Uuid::new_v4();
            active.insert(id, run_id);
            id
        };

        let path = self.root.join(format!("{}-{}", run_id, id));

        if let Err(e) = self.create_dir(&path).await {
            self.active().remove(&id);
            return Err(e);
        }

        info!("Workspace {} acquired for run {}", path.display(), run_id);

        Ok(Workspace { id, run_id, path })
    }

    /// Reclaims a workspace regardless of how its run ended
    ///
    /// The binding is dropped even if the directory cannot be removed, so a
    /// filesystem error never leaks capacity. Removal is tried twice; a
    /// directory that survives both is left for the next startup sweep.
    pub async fn release(&self, workspace: Workspace) -> Result<(), WorkspaceError> {
        self.active().remove(&workspace.id);

        let mut result = fs::remove_dir_all(&workspace.path).await;
        if let Err(e) = &result {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    "Retrying removal of workspace {}: {}",
                    workspace.path.display(),
                    e
                );
                result = fs::remove_dir_all(&workspace.path).await;
            }
        }

        match result {
            Ok(()) => {
                info!(
                    "Workspace {} released for run {}",
                    workspace.path.display(),
                    workspace.run_id
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                error!(
                    "Workspace {} of run {} could not be removed and is orphaned until the next sweep: {}",
                    workspace.path.display(),
                    workspace.run_id,
                    source
                );
                Err(WorkspaceError::Io {
                    path: workspace.path,
                    source,
                })
            }
        }
    }

    /// Removes directories left under the root by a previous process
    ///
    /// Returns how many entries were removed.
    pub async fn sweep(&self) -> Result<usize, WorkspaceError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(WorkspaceError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let in_use: Vec<PathBuf> = self
            .active()
            .iter()
            .map(|(id, run_id)| self.root.join(format!("{}-{}", run_id, id)))
            .collect();

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|source| WorkspaceError::Io {
            path: self.root.clone(),
            source,
        })? {
            let path = entry.path();
            if in_use.contains(&path) {
                continue;
            }

            let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };

            match result {
                Ok(()) => {
                    debug!("Swept stale workspace entry {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} stale workspace(s)", removed);
        }
        Ok(removed)
    }

    async fn create_dir(&self, path: &Path) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;

        // create_dir (not create_dir_all) so an existing path is an error
        fs::create_dir(path)
            .await
            .map_err(|source| WorkspaceError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, Uuid>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_fresh_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 2);
        let run_id = Uuid::new_v4();

        let workspace = manager.acquire(run_id).await.unwrap();
        assert!(workspace.path().is_dir());
        assert!(workspace.path().starts_with(root.path()));
        assert_eq!(workspace.run_id(), run_id);
        assert_eq!(std::fs::read_dir(workspace.path()).unwrap().count(), 0);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_get_distinct_paths() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 4);

        let a = manager.acquire(Uuid::new_v4()).await.unwrap();
        let b = manager.acquire(Uuid::new_v4()).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_same_run_gets_new_identity_after_release() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let run_id = Uuid::new_v4();

        let first = manager.acquire(run_id).await.unwrap();
        let first_path = first.path().to_path_buf();
        manager.release(first).await.unwrap();

        let second = manager.acquire(run_id).await.unwrap();
        assert_ne!(second.path(), first_path.as_path());
    }

    #[tokio::test]
    async fn test_run_cannot_hold_two_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 4);
        let run_id = Uuid::new_v4();

        let _held = manager.acquire(run_id).await.unwrap();
        assert!(matches!(
            manager.acquire(run_id).await,
            Err(WorkspaceError::AlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);

        let held = manager.acquire(Uuid::new_v4()).await.unwrap();
        assert!(matches!(
            manager.acquire(Uuid::new_v4()).await,
            Err(WorkspaceError::Exhausted { capacity: 1 })
        ));

        manager.release(held).await.unwrap();
        assert!(manager.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_removes_contents() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);

        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::create_dir_all(workspace.source_dir()).unwrap();
        std::fs::write(workspace.source_dir().join("Containerfile"), "FROM scratch").unwrap();

        manager.release(workspace).await.unwrap();
        assert!(!path.exists());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);

        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();
        std::fs::remove_dir_all(workspace.path()).unwrap();
        assert!(manager.release(workspace).await.is_ok());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_removal_still_frees_capacity() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);

        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();
        let path = workspace.path().to_path_buf();
        // A plain file where the directory was cannot be removed as a directory
        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, b"not a directory").unwrap();

        let err = manager.release(workspace).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Io { path: ref p, .. } if *p == path));
        assert_eq!(manager.active_count(), 0);

        // Capacity is back, and the orphan goes with the next sweep
        let next = manager.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert!(!path.exists());
        assert!(next.path().is_dir());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_workspaces() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("stale-run")).unwrap();
        std::fs::write(root.path().join("stray-file"), "x").unwrap();

        let manager = WorkspaceManager::new(root.path(), 2);
        let live = manager.acquire(Uuid::new_v4()).await.unwrap();

        assert_eq!(manager.sweep().await.unwrap(), 2);
        assert!(live.path().is_dir());
        assert!(!root.path().join("stale-run").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("absent"), 1);
        assert_eq!(manager.sweep().await.unwrap(), 0);
    }
}
