//! In-memory [`ContainerEngine`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use futures_util::StreamExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ContainerEngine, EngineError, EngineResult, ExecAttachment, ExecOutput};
use crate::registry::ContainerStatus;

/// Test-side ends of an attachment handed out by [`MockEngine::attach_shell`].
///
/// Sending on `output_tx` plays container output; reading `input_rx` sees what
/// the relay wrote to stdin. Dropping `output_tx` simulates process exit.
/// `output_tx.closed()` resolves and `input_rx` hits EOF once the relay has
/// released the attachment.
pub struct AttachedEnds {
    pub engine_id: String,
    pub output_tx: mpsc::Sender<EngineResult<Bytes>>,
    pub input_rx: DuplexStream,
}

/// A configurable mock engine.
///
/// Tracks call counts via atomics. Containers live in a map of engine id to
/// status; every operation succeeds unless its `fail_*` switch is set.
pub struct MockEngine {
    pub pull_count: AtomicUsize,
    pub create_count: AtomicUsize,
    pub start_count: AtomicUsize,
    pub stop_count: AtomicUsize,
    pub remove_count: AtomicUsize,
    pub inspect_count: AtomicUsize,
    pub exec_count: AtomicUsize,
    pub attach_count: AtomicUsize,
    /// `pull_image` reports the image as missing.
    pub fail_pull: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_attach: AtomicBool,
    /// Highest number of start/stop calls observed running at once.
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    next_id: AtomicUsize,
    containers: Mutex<HashMap<String, ContainerStatus>>,
    exec_result: Mutex<ExecOutput>,
    exec_delay: Mutex<Option<Duration>>,
    op_delay: Mutex<Option<Duration>>,
    sessions: Mutex<VecDeque<AttachedEnds>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            pull_count: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
            start_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            remove_count: AtomicUsize::new(0),
            inspect_count: AtomicUsize::new(0),
            exec_count: AtomicUsize::new(0),
            attach_count: AtomicUsize::new(0),
            fail_pull: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            max_in_flight: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            containers: Mutex::new(HashMap::new()),
            exec_result: Mutex::new(ExecOutput::default()),
            exec_delay: Mutex::new(None),
            op_delay: Mutex::new(None),
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Total engine calls of any kind.
    pub fn total_calls(&self) -> usize {
        [
            &self.pull_count,
            &self.create_count,
            &self.start_count,
            &self.stop_count,
            &self.remove_count,
            &self.inspect_count,
            &self.exec_count,
            &self.attach_count,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn set_exec_result(&self, output: &str, exit_code: i64) {
        *lock(&self.exec_result) = ExecOutput {
            output: output.to_string(),
            exit_code,
        };
    }

    /// Make every `exec` sleep before answering.
    pub fn set_exec_delay(&self, delay: Duration) {
        *lock(&self.exec_delay) = Some(delay);
    }

    /// Make every start/stop sleep while counted as in flight.
    pub fn set_op_delay(&self, delay: Duration) {
        *lock(&self.op_delay) = Some(delay);
    }

    pub fn state(&self, engine_id: &str) -> Option<ContainerStatus> {
        lock(&self.containers).get(engine_id).copied()
    }

    /// Change a container behind the service's back.
    pub fn set_state(&self, engine_id: &str, status: ContainerStatus) {
        lock(&self.containers).insert(engine_id.to_string(), status);
    }

    /// Drop a container behind the service's back.
    pub fn vanish(&self, engine_id: &str) {
        lock(&self.containers).remove(engine_id);
    }

    pub fn container_count(&self) -> usize {
        lock(&self.containers).len()
    }

    /// Oldest attachment not yet claimed by the test.
    pub fn take_session_ends(&self) -> Option<AttachedEnds> {
        lock(&self.sessions).pop_front()
    }

    async fn track_in_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *lock(&self.op_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(EngineError::ImageNotFound(image.to_string()));
        }
        Ok(())
    }

    async fn create_container(&self, image: &str) -> EngineResult<String> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Other(format!("Mock create failure for {image}")));
        }
        let engine_id = format!("mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.containers).insert(engine_id.clone(), ContainerStatus::Created);
        Ok(engine_id)
    }

    async fn start_container(&self, engine_id: &str) -> EngineResult<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        self.track_in_flight().await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Other("Mock start failure".into()));
        }
        let mut containers = lock(&self.containers);
        match containers.get_mut(engine_id) {
            None => Err(EngineError::NotFound(engine_id.to_string())),
            Some(ContainerStatus::Running) => Err(EngineError::NotModified(engine_id.to_string())),
            Some(status) => {
                *status = ContainerStatus::Running;
                Ok(())
            }
        }
    }

    async fn stop_container(&self, engine_id: &str) -> EngineResult<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.track_in_flight().await;
        let mut containers = lock(&self.containers);
        match containers.get_mut(engine_id) {
            None => Err(EngineError::NotFound(engine_id.to_string())),
            Some(status) if *status == ContainerStatus::Running => {
                *status = ContainerStatus::Exited;
                Ok(())
            }
            Some(_) => Err(EngineError::NotModified(engine_id.to_string())),
        }
    }

    async fn remove_container(&self, engine_id: &str) -> EngineResult<()> {
        self.remove_count.fetch_add(1, Ordering::SeqCst);
        match lock(&self.containers).remove(engine_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(engine_id.to_string())),
        }
    }

    async fn inspect_container(&self, engine_id: &str) -> EngineResult<Option<ContainerStatus>> {
        self.inspect_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.state(engine_id))
    }

    async fn exec(&self, engine_id: &str, _command: &[String]) -> EngineResult<ExecOutput> {
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        if self.state(engine_id).is_none() {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }
        let delay = *lock(&self.exec_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.exec_result).clone())
    }

    async fn attach_shell(&self, engine_id: &str) -> EngineResult<ExecAttachment> {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(EngineError::Other("Mock attach failure".into()));
        }
        if self.state(engine_id).is_none() {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }

        let (output_tx, output_rx) = mpsc::channel(64);
        let (input, input_rx) = tokio::io::duplex(64 * 1024);
        let exec_id = format!("exec-{}", self.attach_count.load(Ordering::SeqCst));

        lock(&self.sessions).push_back(AttachedEnds {
            engine_id: engine_id.to_string(),
            output_tx,
            input_rx,
        });

        Ok(ExecAttachment {
            exec_id,
            output: ReceiverStream::new(output_rx).boxed(),
            input: Box::pin(input),
        })
    }
}
