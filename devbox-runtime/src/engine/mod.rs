//! Container engine adapter.
//!
//! [`ContainerEngine`] is the seam between the lifecycle manager / session
//! relay and the actual runtime. [`docker::DockerEngine`] talks to a Docker
//! daemon; the mock in [`mock`] backs the tests.

pub mod docker;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::fmt;
use std::pin::Pin;

use axum::body::Bytes;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWrite;

use crate::error::SandboxError;
use crate::registry::ContainerStatus;

/// Engine-level failure, before translation into [`SandboxError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The container (or exec) does not exist on the engine.
    NotFound(String),
    /// The container is already in the requested state.
    NotModified(String),
    /// The image reference could not be resolved.
    ImageNotFound(String),
    Other(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(msg) => write!(f, "no such container: {msg}"),
            EngineError::NotModified(msg) => write!(f, "not modified: {msg}"),
            EngineError::ImageNotFound(msg) => write!(f, "image not found: {msg}"),
            EngineError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ImageNotFound(msg) => SandboxError::ImageUnavailable(msg),
            EngineError::NotFound(msg) => SandboxError::NotFound(msg),
            other => SandboxError::EngineFailure(other.to_string()),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Captured result of a one-shot command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr, lossily decoded as UTF-8.
    pub output: String,
    pub exit_code: i64,
}

/// Live attachment to an interactive process inside a container.
///
/// Dropping both halves releases the engine-side attachment.
pub struct ExecAttachment {
    pub exec_id: String,
    /// Process output (pty stdout/stderr), in engine order. Ends when the
    /// process exits or the attachment is closed.
    pub output: BoxStream<'static, EngineResult<Bytes>>,
    /// Process stdin.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl fmt::Debug for ExecAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecAttachment")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

/// Primitives the lifecycle manager and session relay need from a runtime.
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make `image` available locally.
    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Create (but do not start) a container; returns the engine id.
    async fn create_container(&self, image: &str) -> EngineResult<String>;

    async fn start_container(&self, engine_id: &str) -> EngineResult<()>;

    async fn stop_container(&self, engine_id: &str) -> EngineResult<()>;

    /// Force-remove a container.
    async fn remove_container(&self, engine_id: &str) -> EngineResult<()>;

    /// Current engine-side status, `None` if the container is gone.
    async fn inspect_container(&self, engine_id: &str) -> EngineResult<Option<ContainerStatus>>;

    /// Run `command` to completion and capture its output.
    async fn exec(&self, engine_id: &str, command: &[String]) -> EngineResult<ExecOutput>;

    /// Open an interactive shell with a pseudo-terminal.
    async fn attach_shell(&self, engine_id: &str) -> EngineResult<ExecAttachment>;
}
