//! Container registry: who owns which engine container, and in what state.
//!
//! Pure data access. Status transitions are decided by the lifecycle
//! manager; this module only records them.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::store::PersistentStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    #[default]
    Created,
    Running,
    /// Stopped by request, or the main process exited on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Identifier assigned by the container engine. Unique across the registry.
    pub engine_id: String,
    pub image: String,
    /// Principal id of the single owner.
    pub owner: String,
    pub status: ContainerStatus,
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

pub fn next_container_id() -> String {
    format!("ctr-{}", uuid::Uuid::new_v4())
}

/// Records keyed by engine id.
pub struct ContainerRegistry {
    store: PersistentStore<ContainerRecord>,
}

impl ContainerRegistry {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path)?,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn scratch() -> Self {
        Self {
            store: PersistentStore::scratch(),
        }
    }

    pub fn insert(&self, record: ContainerRecord) -> Result<()> {
        let engine_id = record.engine_id.clone();
        let id = record.id.clone();
        let inserted = self
            .store
            .insert_unique(engine_id.clone(), record, |existing| existing.id == id)?;
        if inserted {
            Ok(())
        } else {
            Err(SandboxError::Conflict(format!(
                "Container '{engine_id}' is already registered"
            )))
        }
    }

    pub fn get_by_engine_id(&self, engine_id: &str) -> Result<Option<ContainerRecord>> {
        self.store.get(engine_id)
    }

    /// Owned records, oldest first.
    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<_> = self
            .store
            .values()?
            .into_iter()
            .filter(|r| r.owner == owner)
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    pub fn set_status(&self, engine_id: &str, status: ContainerStatus) -> Result<ContainerRecord> {
        let now = crate::util::now_ts();
        let updated = self.store.update(engine_id, |r| {
            r.status = status;
            r.updated_at = now;
        })?;
        if !updated {
            return Err(SandboxError::NotFound(format!(
                "Container '{engine_id}' not found"
            )));
        }
        self.store
            .get(engine_id)?
            .ok_or_else(|| SandboxError::NotFound(format!("Container '{engine_id}' not found")))
    }

    pub fn remove(&self, engine_id: &str) -> Result<Option<ContainerRecord>> {
        self.store.remove(engine_id)
    }

    pub fn all(&self) -> Result<Vec<ContainerRecord>> {
        self.store.values()
    }
}
