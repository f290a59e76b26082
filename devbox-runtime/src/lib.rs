//! Per-user workspace containers with a live terminal relay.
//!
//! This crate provides the container engine seam, the ownership-gated
//! lifecycle manager, the bidirectional session relay, and the HTTP/WebSocket
//! API that exposes them.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod principals;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod store;
pub mod util;

pub use api::{ApiSettings, AppState, router};
pub use config::RuntimeConfig;
pub use engine::{ContainerEngine, EngineError, ExecAttachment, ExecOutput};
pub use error::SandboxError;
pub use lifecycle::{LifecycleConfig, LifecycleManager, ProvisionIntent};
pub use registry::{ContainerRecord, ContainerRegistry, ContainerStatus};
pub use relay::{RelayConfig, SessionEnd, SessionReport, run_session};
