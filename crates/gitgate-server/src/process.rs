//! Git plumbing processes.
//!
//! Every pack exchange and ref advertisement is served by running
//! `git-upload-pack` or `git-receive-pack` in stateless-rpc mode. Spawning
//! goes through the [`ProcessSpawner`] trait so tests can observe or replace
//! the process.

use gitgate_protocol::Service;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};

/// Most stderr kept for error reporting.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How the service binary is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// `git-upload-pack ...`, for installs that put the dashed binaries on `PATH`.
    Dashed,
    /// `git upload-pack ...`
    #[default]
    Dispatcher,
}

/// One git plumbing invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub service: Service,
    /// Absolute repository path.
    pub repo_path: PathBuf,
    /// Only print the ref advertisement.
    pub advertise_refs: bool,
}

impl GitCommand {
    /// Pack exchange for `service`.
    pub fn stateless_rpc(service: Service, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            repo_path: repo_path.into(),
            advertise_refs: false,
        }
    }

    /// Ref advertisement for `service`.
    pub fn advertise_refs(service: Service, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            advertise_refs: true,
            ..Self::stateless_rpc(service, repo_path)
        }
    }

    /// Human readable name for logs and errors.
    pub fn describe(&self) -> String {
        format!("git {}", self.service.verb())
    }

    /// Arguments after the service name.
    fn service_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--stateless-rpc")];
        if self.advertise_refs {
            args.push(OsString::from("--advertise-refs"));
        }
        args.push(self.repo_path.clone().into_os_string());
        args
    }
}

/// Starts git processes.
pub trait ProcessSpawner: Send + Sync {
    /// Spawns `command` with stdin, stdout and stderr piped. The child must
    /// be killed when its handle is dropped.
    fn spawn(&self, command: &GitCommand) -> io::Result<Child>;
}

/// Spawns the real git binaries.
#[derive(Debug, Clone)]
pub struct GitSpawner {
    git: PathBuf,
    invocation: Invocation,
}

impl Default for GitSpawner {
    fn default() -> Self {
        Self::new(Invocation::default())
    }
}

impl GitSpawner {
    pub fn new(invocation: Invocation) -> Self {
        Self {
            git: PathBuf::from("git"),
            invocation,
        }
    }

    /// Uses `git` at a specific path. The dashed binaries are looked up
    /// next to it.
    pub fn with_git(mut self, git: impl Into<PathBuf>) -> Self {
        self.git = git.into();
        self
    }

    /// Program and arguments for `command`.
    pub fn command_line(&self, command: &GitCommand) -> (PathBuf, Vec<OsString>) {
        match self.invocation {
            Invocation::Dispatcher => {
                let mut args = vec![OsString::from(command.service.verb())];
                args.extend(command.service_args());
                (self.git.clone(), args)
            }
            Invocation::Dashed => {
                let program = self.git.with_file_name(command.service.as_str());
                (program, command.service_args())
            }
        }
    }
}

impl ProcessSpawner for GitSpawner {
    fn spawn(&self, command: &GitCommand) -> io::Result<Child> {
        let (program, args) = self.command_line(command);
        tracing::debug!(
            program = %program.display(),
            repo = %command.repo_path.display(),
            advertise_refs = command.advertise_refs,
            "spawning git"
        );

        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Reads a child's stderr to the end, keeping the first
/// [`MAX_STDERR_BYTES`].
pub async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                tracing::debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }

    String::from_utf8_lossy(&kept).trim().to_string()
}
