//! Backend process spawning
//!
//! Sessions never spawn processes themselves; they go through a
//! [`ProcessLauncher`], so tests can substitute in-memory backends.

use crate::config::BackendDescriptor;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

/// Byte streams and process handle of a freshly started backend
pub struct LaunchedBackend {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn BackendProcess>,
}

/// A running backend process
#[async_trait]
pub trait BackendProcess: Send {
    /// Wait for exit; yields the exit code when the platform reports one
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Request termination without waiting
    fn start_kill(&mut self);

    /// OS process id, if any
    fn id(&self) -> Option<u32>;
}

/// Starts backend processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, descriptor: &BackendDescriptor) -> BridgeResult<LaunchedBackend>;
}

/// Launcher that spawns real subprocesses with piped stdio
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, descriptor: &BackendDescriptor) -> BridgeResult<LaunchedBackend> {
        let mut cmd = Command::new(&descriptor.command);

        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .current_dir(&descriptor.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::handshake(
                descriptor.key().id(),
                format!("Failed to spawn '{}': {}", descriptor.command, e),
            )
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::handshake(descriptor.key().id(), "Failed to get stdin handle")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::handshake(descriptor.key().id(), "Failed to get stdout handle")
        })?;

        debug!(
            backend = %descriptor.key(),
            pid = ?child.id(),
            command = %descriptor.command,
            "Spawned backend process"
        );

        Ok(LaunchedBackend {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl BackendProcess for ChildProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn start_kill(&mut self) {
        // Fails only when the process already exited
        let _ = self.child.start_kill();
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
