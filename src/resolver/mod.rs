//! Setup instruction resolution.
//!
//! An [`InstructionResolver`] turns README text into a shell command. The
//! pipeline treats every resolver error as "no instructions found", so a
//! broken resolver can never fail a job.

pub mod llm;

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ResolveError;

pub use llm::LlmInstructionResolver;

/// README files looked up in the workspace root, in order.
pub const README_CANDIDATES: [&str; 4] = ["README.md", "README.txt", "readme.md", "readme.txt"];

/// Command used when no instructions can be extracted.
pub const DEFAULT_SETUP_COMMAND: &str = "npm install && npm start";

/// Extracts a setup command from repository documentation.
#[async_trait]
pub trait InstructionResolver: Send + Sync {
    /// Returns a shell command, or `None` if the text holds no instructions.
    async fn resolve(&self, readme: &str) -> Result<Option<String>, ResolveError>;
}

/// Always answers with the same command.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    command: Option<String>,
}

impl StaticResolver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
        }
    }

    /// A resolver that never finds instructions.
    pub fn none() -> Self {
        Self { command: None }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new(DEFAULT_SETUP_COMMAND)
    }
}

#[async_trait]
impl InstructionResolver for StaticResolver {
    async fn resolve(&self, _readme: &str) -> Result<Option<String>, ResolveError> {
        Ok(self.command.clone())
    }
}

/// Reads the first README candidate present in `dir`.
pub async fn read_readme(dir: &Path) -> Option<String> {
    for name in README_CANDIDATES {
        let path = dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), "Found README");
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            Err(_) => continue,
        }
    }
    None
}

/// Turns free-form model output into one `&&`-joined command line.
///
/// Code fences, blank lines, comment lines and leading `$ ` prompts are
/// dropped. Returns `None` when nothing is left.
pub fn normalize_commands(text: &str) -> Option<String> {
    let commands: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("```"))
        .filter(|line| !line.starts_with('#') && !line.starts_with("//"))
        .map(|line| line.strip_prefix("$ ").unwrap_or(line).trim())
        .filter(|line| !line.is_empty())
        .collect();

    if commands.is_empty() {
        None
    } else {
        Some(commands.join(" && "))
    }
}
