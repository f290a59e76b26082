//! Startup reconciliation: sync registry rows with what the engine reports.

use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::metrics::metrics;
use crate::registry::ContainerRegistry;
use crate::util::short_id;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inspected: usize,
    /// Rows whose container no longer exists.
    pub removed: usize,
    /// Rows whose status disagreed with the engine.
    pub updated: usize,
    /// Containers the engine could not be asked about; left untouched.
    pub failed: usize,
    /// Rows left in the registry afterwards.
    pub remaining: usize,
}

/// Reconcile stored container state with engine reality.
///
/// Run once before serving traffic, so no lifecycle operation races it.
pub async fn reconcile_registry(
    engine: &dyn ContainerEngine,
    registry: &ContainerRegistry,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for record in registry.all()? {
        summary.inspected += 1;
        let container_id = short_id(&record.engine_id);

        match engine.inspect_container(&record.engine_id).await {
            Err(err) => {
                tracing::error!(container_id, error = %err, "reconcile: inspect failed");
                summary.failed += 1;
            }
            Ok(None) => {
                tracing::info!(
                    container_id,
                    owner = %record.owner,
                    "reconcile: removing record, container is gone"
                );
                registry.remove(&record.engine_id)?;
                summary.removed += 1;
            }
            Ok(Some(actual)) if actual != record.status => {
                tracing::info!(
                    container_id,
                    recorded = %record.status,
                    actual = %actual,
                    "reconcile: correcting status"
                );
                registry.set_status(&record.engine_id, actual)?;
                summary.updated += 1;
            }
            Ok(Some(_)) => {}
        }
    }

    summary.remaining = summary.inspected - summary.removed;
    metrics().record_reconciled((summary.removed + summary.updated) as u64);
    metrics().sync_active_containers(summary.remaining as u64);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::registry::{ContainerRecord, ContainerStatus};

    async fn seed(engine: &MockEngine, registry: &ContainerRegistry, status: ContainerStatus) -> String {
        let engine_id = engine.create_container("alpine").await.unwrap();
        engine.set_state(&engine_id, status);
        registry
            .insert(ContainerRecord {
                id: crate::registry::next_container_id(),
                engine_id: engine_id.clone(),
                image: "alpine".into(),
                owner: "alice".into(),
                status,
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();
        engine_id
    }

    #[tokio::test]
    async fn removes_vanished_and_fixes_drifted_records() {
        let engine = MockEngine::new();
        let registry = ContainerRegistry::scratch();

        let steady = seed(&engine, &registry, ContainerStatus::Running).await;
        let gone = seed(&engine, &registry, ContainerStatus::Running).await;
        let crashed = seed(&engine, &registry, ContainerStatus::Running).await;
        engine.vanish(&gone);
        engine.set_state(&crashed, ContainerStatus::Exited);

        let summary = reconcile_registry(&engine, &registry).await.unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                inspected: 3,
                removed: 1,
                updated: 1,
                failed: 0,
                remaining: 2,
            }
        );

        assert!(registry.get_by_engine_id(&gone).unwrap().is_none());
        assert_eq!(
            registry.get_by_engine_id(&crashed).unwrap().unwrap().status,
            ContainerStatus::Exited
        );
        assert_eq!(
            registry.get_by_engine_id(&steady).unwrap().unwrap().status,
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let engine = MockEngine::new();
        let summary = reconcile_registry(&engine, &ContainerRegistry::scratch())
            .await
            .unwrap();
        assert_eq!(summary, ReconcileSummary::default());
        assert_eq!(engine.total_calls(), 0);
    }
}
