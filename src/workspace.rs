//! Collaborator seams - workspace provisioning and worker launching

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OverseerError, Result};
use crate::types::AgentId;

/// Creates and releases isolated per-agent working directories
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn create(&self, agent_id: &AgentId) -> Result<PathBuf>;

    /// Remove a workspace. `Ok(false)` if it was already gone.
    async fn release(&self, path: &Path) -> Result<bool>;
}

/// Handle to a launched worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub agent_id: AgentId,
    pub pid: Option<u32>,
}

/// Starts an external worker process for an agent
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(
        &self,
        agent_id: &AgentId,
        role: &str,
        workspace: &Path,
    ) -> Result<ProcessHandle>;
}

/// Plain directories under a root, one per agent
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn create(&self, agent_id: &AgentId) -> Result<PathBuf> {
        let path = self.root.join(agent_id.as_str());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| OverseerError::io(&path, e))?;
        debug!(agent_id = %agent_id, path = %path.display(), "Workspace created");
        Ok(path)
    }

    async fn release(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) {
            return Err(OverseerError::ResourceRelease {
                path: path.to_path_buf(),
                reason: format!("outside workspace root {}", self.root.display()),
            });
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OverseerError::ResourceRelease {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Runs a fixed command per worker, inside its workspace.
///
/// The agent id and role are passed through `OVERSEER_AGENT_ID` and
/// `OVERSEER_ROLE`; the worker reads its assignment from the mailbox.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn spawn(
        &self,
        agent_id: &AgentId,
        role: &str,
        workspace: &Path,
    ) -> Result<ProcessHandle> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(workspace)
            .env("OVERSEER_AGENT_ID", agent_id.as_str())
            .env("OVERSEER_ROLE", role)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| OverseerError::io(workspace, e))?;

        let pid = child.id();
        info!(agent_id = %agent_id, role, pid = ?pid, "Worker launched");
        Ok(ProcessHandle {
            agent_id: agent_id.clone(),
            pid,
        })
    }
}
