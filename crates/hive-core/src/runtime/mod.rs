//! Container runtime capability boundary.
//!
//! Every component talks to containers through [`ContainerRuntime`], never
//! to a daemon directly. [`docker::DockerCli`] drives a real Docker daemon;
//! [`fakes::FakeRuntime`] is a scripted in-memory runtime for tests.
//!
//! # Modules
//!
//! - [`docker`]: `DockerCli`, the `docker` binary adapter
//! - [`fakes`]: `FakeRuntime` and `ImageScript`
//! - [`lease`]: `ContainerLease`, guaranteed stop+remove on every path

pub mod docker;
pub mod fakes;
pub mod lease;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

pub use docker::DockerCli;
pub use lease::ContainerLease;

/// Errors reported by a container runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// The image build ran and failed. Carries the tail of the build output.
    #[error("image build {tag} failed: {output}")]
    BuildFailed { tag: String, output: String },

    /// The daemon could not be reached.
    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    /// A runtime API call failed.
    #[error("{op} failed: {reason}")]
    Api { op: &'static str, reason: String },

    /// The container does not exist (already removed or never created).
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// The requested file does not exist inside the container.
    #[error("file {path} not found in container {container}")]
    FileNotFound { container: String, path: String },
}

impl RuntimeError {
    pub fn api(op: &'static str, reason: impl Into<String>) -> Self {
        RuntimeError::Api {
            op,
            reason: reason.into(),
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Reference to a built image (its tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// First 12 characters, the conventional short container id.
    pub fn short(&self) -> &str {
        match self.id.char_indices().nth(12) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// A host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to start a container from an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

impl RunSpec {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }
}

/// How a `wait` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Exit status, absent when the wait timed out before the container exited.
    pub exit_code: Option<i64>,
    pub timed_out: bool,
}

impl WaitOutcome {
    pub fn exited(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            timed_out: true,
        }
    }
}

/// Byte stream of a container's combined stdout/stderr.
pub type LogStream = Pin<Box<dyn Stream<Item = RuntimeResult<Vec<u8>>> + Send>>;

/// The operations the orchestration engine needs from a container daemon.
///
/// Guarantees callers rely on:
/// - `build_image` reports a failed build as `RuntimeError::BuildFailed`;
///   any other error means the daemon itself misbehaved.
/// - `wait` returns once the container exits, including after `kill`.
/// - `kill` and `remove` are safe to call on a container that has already
///   exited.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Daemon version string; doubles as a liveness check.
    async fn version(&self) -> RuntimeResult<String>;

    /// Build `context` into an image tagged `tag`, bypassing the layer cache
    /// when `no_cache` is set.
    async fn build_image(&self, context: &Path, tag: &str, no_cache: bool)
        -> RuntimeResult<ImageRef>;

    /// Create and start a container.
    async fn run(&self, image: &ImageRef, spec: &RunSpec) -> RuntimeResult<ContainerHandle>;

    /// Block until the container exits or `timeout` elapses.
    async fn wait(
        &self,
        handle: &ContainerHandle,
        timeout: Option<Duration>,
    ) -> RuntimeResult<WaitOutcome>;

    /// Forcibly stop a container.
    async fn kill(&self, handle: &ContainerHandle) -> RuntimeResult<()>;

    /// Delete a container and its anonymous volumes.
    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()>;

    /// Everything the container wrote to stdout/stderr so far.
    fn logs(&self, handle: &ContainerHandle) -> LogStream;

    /// Read a single file out of a container's filesystem.
    async fn copy_from(&self, handle: &ContainerHandle, path: &str) -> RuntimeResult<Vec<u8>>;
}

/// Collect a log stream and keep only the last `max_lines` lines.
pub async fn log_tail(mut stream: LogStream, max_lines: usize) -> RuntimeResult<String> {
    use futures::StreamExt;

    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].join("\n"))
}
