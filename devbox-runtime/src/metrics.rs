//! Process-wide counters, served as JSON on `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics tracker using atomic counters.
///
/// Relaxed ordering throughout: these are gauges read by the metrics
/// endpoint, not synchronization points.
pub struct DevboxMetrics {
    /// Containers provisioned since startup.
    pub containers_provisioned: AtomicU64,
    /// Containers deleted since startup.
    pub containers_deleted: AtomicU64,
    /// Current registry size: seeded by startup reconciliation, then moved by
    /// provision, delete and vanished containers.
    pub active_containers: AtomicU64,
    pub peak_containers: AtomicU64,
    /// One-shot commands run to completion.
    pub execs: AtomicU64,
    pub exec_timeouts: AtomicU64,
    /// Lifecycle operations that ended in an engine or storage error.
    pub failed_operations: AtomicU64,
    pub active_sessions: AtomicU64,
    pub total_sessions: AtomicU64,
    /// Bytes forwarded from clients to container stdin.
    pub bytes_to_container: AtomicU64,
    /// Bytes forwarded from container output to clients.
    pub bytes_to_client: AtomicU64,
    /// Registry rows fixed up because the engine disagreed with them.
    pub reconciled_records: AtomicU64,
}

impl Default for DevboxMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DevboxMetrics {
    pub const fn new() -> Self {
        Self {
            containers_provisioned: AtomicU64::new(0),
            containers_deleted: AtomicU64::new(0),
            active_containers: AtomicU64::new(0),
            peak_containers: AtomicU64::new(0),
            execs: AtomicU64::new(0),
            exec_timeouts: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
            bytes_to_container: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            reconciled_records: AtomicU64::new(0),
        }
    }

    pub fn record_provisioned(&self) {
        self.containers_provisioned.fetch_add(1, Ordering::Relaxed);
        let current = self.active_containers.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_containers.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.containers_deleted.fetch_add(1, Ordering::Relaxed);
        saturating_dec(&self.active_containers);
    }

    pub fn record_exec(&self) {
        self.execs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exec_timeout(&self) {
        self.exec_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, to_container: u64, to_client: u64) {
        self.bytes_to_container
            .fetch_add(to_container, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(to_client, Ordering::Relaxed);
    }

    pub fn record_reconciled(&self, count: u64) {
        self.reconciled_records.fetch_add(count, Ordering::Relaxed);
    }

    /// A container disappeared from the engine and its row was dropped.
    pub fn record_vanished(&self) {
        self.reconciled_records.fetch_add(1, Ordering::Relaxed);
        saturating_dec(&self.active_containers);
    }

    /// Reset the container gauge to the registry size after reconciliation.
    pub fn sync_active_containers(&self, registered: u64) {
        self.active_containers.store(registered, Ordering::Relaxed);
        self.peak_containers.fetch_max(registered, Ordering::Relaxed);
    }

    /// Start a session and return a guard that decrements on drop.
    pub fn session_guard(&'static self) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard(self)
    }

    /// Snapshot all metrics as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("containers_provisioned".into(), load(&self.containers_provisioned)),
            ("containers_deleted".into(), load(&self.containers_deleted)),
            ("active_containers".into(), load(&self.active_containers)),
            ("peak_containers".into(), load(&self.peak_containers)),
            ("execs".into(), load(&self.execs)),
            ("exec_timeouts".into(), load(&self.exec_timeouts)),
            ("failed_operations".into(), load(&self.failed_operations)),
            ("active_sessions".into(), load(&self.active_sessions)),
            ("total_sessions".into(), load(&self.total_sessions)),
            ("bytes_to_container".into(), load(&self.bytes_to_container)),
            ("bytes_to_client".into(), load(&self.bytes_to_client)),
            ("reconciled_records".into(), load(&self.reconciled_records)),
        ]
    }
}

fn saturating_dec(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

/// RAII guard that decrements `active_sessions` when dropped, including on
/// panic or task cancellation.
pub struct SessionGuard(&'static DevboxMetrics);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        saturating_dec(&self.0.active_sessions);
    }
}

static METRICS: DevboxMetrics = DevboxMetrics::new();

/// Returns the global metrics tracker.
pub fn metrics() -> &'static DevboxMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(snapshot: &[(String, u64)], key: &str) -> u64 {
        snapshot
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .unwrap()
    }

    #[test]
    fn session_guard_balances_on_drop() {
        static LOCAL: DevboxMetrics = DevboxMetrics::new();
        {
            let _a = LOCAL.session_guard();
            let _b = LOCAL.session_guard();
            assert_eq!(LOCAL.active_sessions.load(Ordering::Relaxed), 2);
        }
        assert_eq!(LOCAL.active_sessions.load(Ordering::Relaxed), 0);
        assert_eq!(LOCAL.total_sessions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn container_gauge_tracks_peak_and_never_underflows() {
        let m = DevboxMetrics::new();
        m.record_provisioned();
        m.record_provisioned();
        m.record_deleted();
        m.record_deleted();
        m.record_deleted();

        let snap = m.snapshot();
        assert_eq!(value(&snap, "active_containers"), 0);
        assert_eq!(value(&snap, "peak_containers"), 2);
        assert_eq!(value(&snap, "containers_deleted"), 3);
    }

    #[test]
    fn gauge_follows_reconciliation() {
        let m = DevboxMetrics::new();
        m.sync_active_containers(3);
        m.record_vanished();
        m.record_provisioned();

        let snap = m.snapshot();
        assert_eq!(value(&snap, "active_containers"), 3);
        assert_eq!(value(&snap, "peak_containers"), 3);
        assert_eq!(value(&snap, "reconciled_records"), 1);
    }
}
