//! Repository fetching.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::Workspace;
use crate::error::FetchError;

/// Longest clone error message kept, in characters.
const MAX_ERROR_CHARS: usize = 2000;

/// Brings a repository into a fresh workspace.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Creates a workspace for this attempt and fills it with the repository.
    ///
    /// On error the workspace is already gone.
    async fn fetch(
        &self,
        repo_url: &str,
        job_id: Uuid,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Workspace, FetchError>;
}

/// Shallow-clones repositories with the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    root: PathBuf,
    git_binary: String,
    depth: u32,
}

impl GitFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git_binary: "git".to_string(),
            depth: 1,
        }
    }

    /// Uses a different git executable.
    pub fn with_git_binary(mut self, binary: impl Into<String>) -> Self {
        self.git_binary = binary.into();
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn clone_args(&self, repo_url: &str) -> Vec<String> {
        vec![
            "clone".to_string(),
            "--depth".to_string(),
            self.depth.to_string(),
            "--quiet".to_string(),
            "--".to_string(),
            repo_url.to_string(),
            ".".to_string(),
        ]
    }
}

fn clone_message(stderr: &[u8], code: Option<i32>) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return match code {
            Some(code) => format!("git exited with status {}", code),
            None => "git was terminated by a signal".to_string(),
        };
    }
    text.chars().take(MAX_ERROR_CHARS).collect()
}

#[async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        job_id: Uuid,
        attempt_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Workspace, FetchError> {
        let workspace = Workspace::create(&self.root, job_id, attempt_id)?;
        info!(job_id = %job_id, repo_url = %repo_url, path = %workspace.path().display(), "Cloning repository");

        let mut command = tokio::process::Command::new(&self.git_binary);
        command
            .args(self.clone_args(repo_url))
            .current_dir(workspace.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            // Dropping the output future kills the child.
            _ = cancel.cancelled() => {
                return Err(FetchError::Cancelled { url: repo_url.to_string() });
            }
            output = command.output() => output.map_err(|e| FetchError::CloneFailed {
                url: repo_url.to_string(),
                message: format!("failed to run {}: {}", self.git_binary, e),
            })?,
        };

        if !output.status.success() {
            return Err(FetchError::CloneFailed {
                url: repo_url.to_string(),
                message: clone_message(&output.stderr, output.status.code()),
            });
        }

        debug!(job_id = %job_id, "Repository cloned");
        Ok(workspace)
    }
}
