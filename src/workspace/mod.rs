//! Per-attempt workspaces and repository fetching.
//!
//! Every attempt gets its own directory named `job-{job_id}-{attempt_id}-*`
//! under the configured root. The directory is removed when the
//! [`Workspace`] is dropped, on every exit path.

pub mod fetcher;

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

pub use fetcher::{GitFetcher, RepositoryFetcher};

/// An exclusive, disposable directory for one attempt.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    job_id: Uuid,
    attempt_id: Uuid,
}

impl Workspace {
    /// Creates a fresh workspace under `root`, creating `root` if needed.
    pub fn create(root: &Path, job_id: Uuid, attempt_id: Uuid) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-{}-", job_id, attempt_id))
            .tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!(job_id = %job_id, attempt_id = %attempt_id, path = %path.display(), "Created workspace");

        Ok(Self {
            dir: Some(dir),
            path,
            job_id,
            attempt_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    /// Removes the workspace now, reporting failures.
    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(
                    job_id = %self.job_id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_naming_and_cleanup() {
        let root = tempfile::tempdir().expect("root");
        let job_id = Uuid::new_v4();
        let attempt_id = Uuid::new_v4();

        let ws = Workspace::create(root.path(), job_id, attempt_id).expect("create");
        let path = ws.path().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name")
            .to_string();

        assert!(name.starts_with(&format!("job-{}-{}-", job_id, attempt_id)));
        assert!(path.is_dir());

        std::fs::write(path.join("README.md"), "# hello").expect("write");
        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn test_same_job_attempts_never_alias() {
        let root = tempfile::tempdir().expect("root");
        let job_id = Uuid::new_v4();

        let a = Workspace::create(root.path(), job_id, Uuid::new_v4()).expect("a");
        let b = Workspace::create(root.path(), job_id, Uuid::new_v4()).expect("b");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_close_removes_directory() {
        let root = tempfile::tempdir().expect("root");
        let ws = Workspace::create(&root.path().join("nested"), Uuid::new_v4(), Uuid::new_v4())
            .expect("create");
        let path = ws.path().to_path_buf();

        ws.close().expect("close");
        assert!(!path.exists());
    }
}
