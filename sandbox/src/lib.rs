//! Isolated process instances for running the external schema change tool.
//!
//! The driver is a small capability set polymorphic over backends: the real
//! one shells out to the docker CLI, the mock one is an inert scripted
//! stand-in for tests. Backend selection happens once at construction; the
//! hot log path only ever sees a concrete callback.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

mod docker;
mod mock;

pub use docker::{DockerCliDriver, DEFAULT_IMAGE};
pub use mock::{MockDriver, MockScript};

/// Default CPU cap for one sandbox, in cores.
pub const DEFAULT_CPU_LIMIT: f64 = 2.0;
/// Default memory cap for one sandbox.
pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox {0} not found")]
    NotFound(String),
    #[error("`{command}` failed: {stderr}")]
    Cli { command: String, stderr: String },
    #[error("unexpected output from the container runtime: {0}")]
    Malformed(String),
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Per-line sink for streamed sandbox output. Shared between the stdout and
/// stderr followers, hence `Arc` instead of `Box`.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// The shell command, run under `sh -lc`
    pub command: String,
    /// Environment passed to the sandbox; this is where secrets belong
    pub env: HashMap<String, String>,
    pub cpu_limit: f64,
    pub memory_bytes: u64,
    pub network_mode: String,
    pub working_dir: String,
    pub auto_remove: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            env: HashMap::new(),
            cpu_limit: DEFAULT_CPU_LIMIT,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            network_mode: "bridge".to_string(),
            working_dir: "/tmp".to_string(),
            auto_remove: false,
        }
    }
}

/// Result of waiting for a sandbox to exit.
#[derive(Debug, Clone)]
pub struct SandboxExit {
    pub exit_code: i64,
    /// Complete concatenation of stdout and stderr up to exit
    pub output: String,
    /// Stderr only, for error messages
    pub error: String,
    pub duration: Duration,
}

/// The sandbox capability set.
///
/// Any operation may fail with a transient I/O error. A failed `create`,
/// `start` or `wait` is fatal for the task using the sandbox; a failed `stop`
/// during cancellation is logged and followed by a forced `remove`.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Create an instance and return its opaque id. Does not start it.
    async fn create(&self, config: &SandboxConfig) -> SandboxResult<String>;

    async fn start(&self, id: &str) -> SandboxResult<()>;

    /// Ask the sandbox to terminate, force-killing after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> SandboxResult<()>;

    /// Block until the sandbox exits and collect its output.
    async fn wait(&self, id: &str) -> SandboxResult<SandboxExit>;

    /// Spawn a background follower that feeds every newline-terminated line
    /// to `sink`, preserving the interleaving observed on the streams.
    /// Returns once the follow is established.
    async fn stream_logs(&self, id: &str, sink: LogSink) -> SandboxResult<()>;

    /// Release all resources held by the instance.
    async fn remove(&self, id: &str, force: bool) -> SandboxResult<()>;

    /// Release driver-wide resources on shutdown.
    async fn close(&self) -> SandboxResult<()> {
        Ok(())
    }
}
