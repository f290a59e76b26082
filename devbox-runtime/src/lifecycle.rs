//! Container lifecycle: provisioning, start/stop/delete, one-shot exec and
//! session attachment, all behind a single ownership gate.
//!
//! Ordering rules:
//! - ownership and existence are resolved before any engine call
//! - the registry is written only after the engine acknowledged the change
//! - operations on the same container id are serialized by [`ContainerGates`]

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::{ContainerEngine, EngineError, ExecAttachment, ExecOutput};
use crate::error::{Result, SandboxError};
use crate::metrics::metrics;
use crate::registry::{ContainerRecord, ContainerRegistry, ContainerStatus, next_container_id};
use crate::util::short_id;

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Pull the image before every create.
    pub pull_images: bool,
    /// Bound on one-shot exec when the caller gives none.
    pub exec_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pull_images: true,
            exec_timeout: Duration::from_secs(crate::config::DEFAULT_EXEC_TIMEOUT_SECS),
        }
    }
}

/// What the caller wants out of a provision request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionIntent {
    /// Create only; the record starts as `created`.
    Create,
    /// Create then start; the record starts as `running`.
    CreateAndStart,
}

/// Per-container mutual exclusion keyed by engine id.
///
/// An entry lives only while some caller holds or waits on it, so ids that
/// never resolve to a container do not accumulate.
#[derive(Default)]
pub struct ContainerGates {
    gates: DashMap<String, Arc<Mutex<()>>>,
}

/// Held gate for one container id. Dropping it releases the lock and
/// forgets the entry when nobody else is queued on it.
pub struct GateGuard<'a> {
    gates: &'a ContainerGates,
    engine_id: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.gates
            .gates
            .remove_if(&self.engine_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

impl ContainerGates {
    pub async fn lock(&self, engine_id: &str) -> GateGuard<'_> {
        // Clone the Arc out so the map shard is not held across the await.
        let gate = self
            .gates
            .entry(engine_id.to_string())
            .or_default()
            .value()
            .clone();
        let held = gate.lock_owned().await;
        GateGuard {
            gates: self,
            engine_id: engine_id.to_string(),
            held: Some(held),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    gates: ContainerGates,
    config: LifecycleConfig,
}

fn engine_failure(err: EngineError) -> SandboxError {
    metrics().record_failure();
    err.into()
}

impl LifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            gates: ContainerGates::default(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn gates(&self) -> &ContainerGates {
        &self.gates
    }

    /// The single authorization gate: `NotFound` if there is no such
    /// container, `Forbidden` if `owner` does not own it.
    pub fn authorize(&self, owner: &str, engine_id: &str) -> Result<ContainerRecord> {
        let record = self
            .registry
            .get_by_engine_id(engine_id)?
            .ok_or_else(|| SandboxError::NotFound(format!("Container '{engine_id}' not found")))?;
        if record.owner != owner {
            return Err(SandboxError::Forbidden(format!(
                "Not permitted to access container '{engine_id}'"
            )));
        }
        Ok(record)
    }

    pub async fn provision(
        &self,
        owner: &str,
        image: &str,
        intent: ProvisionIntent,
    ) -> Result<ContainerRecord> {
        let image = image.trim();
        if image.is_empty() {
            return Err(SandboxError::Validation("image must not be empty".into()));
        }

        if self.config.pull_images {
            self.engine.pull_image(image).await.map_err(engine_failure)?;
        }
        let engine_id = self
            .engine
            .create_container(image)
            .await
            .map_err(engine_failure)?;

        let mut status = ContainerStatus::Created;
        if intent == ProvisionIntent::CreateAndStart {
            match self.engine.start_container(&engine_id).await {
                Ok(()) | Err(EngineError::NotModified(_)) => status = ContainerStatus::Running,
                Err(err) => {
                    self.discard(&engine_id).await;
                    return Err(engine_failure(err));
                }
            }
        }

        let now = crate::util::now_ts();
        let record = ContainerRecord {
            id: next_container_id(),
            engine_id: engine_id.clone(),
            image: image.to_string(),
            owner: owner.to_string(),
            status,
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.registry.insert(record.clone()) {
            self.discard(&engine_id).await;
            return Err(err);
        }

        metrics().record_provisioned();
        tracing::info!(
            container_id = %short_id(&engine_id),
            owner,
            image,
            %status,
            "provisioned container"
        );
        Ok(record)
    }

    /// Best-effort removal of a container that never made it into the registry.
    async fn discard(&self, engine_id: &str) {
        if let Err(err) = self.engine.remove_container(engine_id).await {
            tracing::warn!(
                container_id = %short_id(engine_id),
                error = %err,
                "failed to remove orphaned container"
            );
        }
    }

    pub fn list(&self, owner: &str) -> Result<Vec<ContainerRecord>> {
        self.registry.list_by_owner(owner)
    }

    pub async fn start(&self, owner: &str, engine_id: &str) -> Result<ContainerRecord> {
        let _gate = self.gates.lock(engine_id).await;
        let record = self.authorize(owner, engine_id)?;

        match self.engine.start_container(&record.engine_id).await {
            Ok(()) => {}
            Err(EngineError::NotModified(_)) => {
                tracing::debug!(container_id = %short_id(engine_id), "already running");
            }
            Err(err) => return Err(engine_failure(err)),
        }

        let updated = self
            .registry
            .set_status(&record.engine_id, ContainerStatus::Running)?;
        tracing::info!(container_id = %short_id(engine_id), owner, "started container");
        Ok(updated)
    }

    pub async fn stop(&self, owner: &str, engine_id: &str) -> Result<ContainerRecord> {
        let _gate = self.gates.lock(engine_id).await;
        let record = self.authorize(owner, engine_id)?;

        match self.engine.stop_container(&record.engine_id).await {
            Ok(()) => {}
            Err(EngineError::NotModified(_)) => {
                tracing::debug!(container_id = %short_id(engine_id), "already stopped");
            }
            Err(EngineError::NotFound(_)) => return self.drop_vanished(record),
            Err(err) => return Err(engine_failure(err)),
        }

        let updated = self
            .registry
            .set_status(&record.engine_id, ContainerStatus::Exited)?;
        tracing::info!(container_id = %short_id(engine_id), owner, "stopped container");
        Ok(updated)
    }

    /// Stop and remove the container, then drop its record. A container
    /// already gone from the engine still has its record removed.
    pub async fn delete(&self, owner: &str, engine_id: &str) -> Result<()> {
        let gate = self.gates.lock(engine_id).await;
        let record = self.authorize(owner, engine_id)?;

        match self.engine.stop_container(&record.engine_id).await {
            Ok(()) | Err(EngineError::NotModified(_)) | Err(EngineError::NotFound(_)) => {}
            Err(err) => return Err(engine_failure(err)),
        }
        match self.engine.remove_container(&record.engine_id).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                tracing::info!(
                    container_id = %short_id(engine_id),
                    "container already gone from engine"
                );
            }
            Err(err) => return Err(engine_failure(err)),
        }

        self.registry.remove(&record.engine_id)?;
        drop(gate);

        metrics().record_deleted();
        tracing::info!(container_id = %short_id(engine_id), owner, "deleted container");
        Ok(())
    }

    /// The engine no longer has the container: drop the row and report the
    /// container as exited.
    fn drop_vanished(&self, mut record: ContainerRecord) -> Result<ContainerRecord> {
        self.registry.remove(&record.engine_id)?;
        metrics().record_vanished();
        tracing::info!(
            container_id = %short_id(&record.engine_id),
            owner = %record.owner,
            "container gone from engine; record removed"
        );
        record.status = ContainerStatus::Exited;
        record.updated_at = crate::util::now_ts();
        Ok(record)
    }

    /// Owned and running, checked under the container gate.
    pub async fn require_running(&self, owner: &str, engine_id: &str) -> Result<ContainerRecord> {
        let _gate = self.gates.lock(engine_id).await;
        let record = self.authorize(owner, engine_id)?;
        if record.status != ContainerStatus::Running {
            return Err(SandboxError::NotRunning(format!(
                "Container '{engine_id}' is {}",
                record.status
            )));
        }
        Ok(record)
    }

    /// Run `command` to completion, bounded by `timeout` (or the configured
    /// default).
    pub async fn exec(
        &self,
        owner: &str,
        engine_id: &str,
        command: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(SandboxError::Validation("command must not be empty".into()));
        }
        let record = self.require_running(owner, engine_id).await?;
        let timeout = timeout.unwrap_or(self.config.exec_timeout);

        match tokio::time::timeout(timeout, self.engine.exec(&record.engine_id, command)).await {
            Ok(Ok(output)) => {
                metrics().record_exec();
                tracing::debug!(
                    container_id = %short_id(engine_id),
                    exit_code = output.exit_code,
                    "exec finished"
                );
                Ok(output)
            }
            Ok(Err(err)) => Err(engine_failure(err)),
            Err(_) => {
                metrics().record_exec_timeout();
                tracing::warn!(
                    container_id = %short_id(engine_id),
                    timeout_ms = timeout.as_millis() as u64,
                    "exec timed out"
                );
                Err(SandboxError::Timeout(format!(
                    "Command did not finish within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Attach an interactive shell for a terminal session. Each call gets its
    /// own exec attachment.
    pub async fn open_session(&self, owner: &str, engine_id: &str) -> Result<ExecAttachment> {
        let record = self.require_running(owner, engine_id).await?;
        let attachment = self
            .engine
            .attach_shell(&record.engine_id)
            .await
            .map_err(engine_failure)?;
        tracing::info!(
            container_id = %short_id(engine_id),
            exec_id = %short_id(&attachment.exec_id),
            owner,
            "attached shell"
        );
        Ok(attachment)
    }
}
