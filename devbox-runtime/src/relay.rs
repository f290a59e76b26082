//! Terminal session relay.
//!
//! Bridges one client connection to one attached shell. Two pumps run as
//! separate tasks:
//!
//! - container output → client frames
//! - client frames → container stdin
//!
//! The first pump to stop (end of stream, I/O error or panic) flips a shared
//! `watch` flag; the other pump is parked in a `select!` on that flag next to
//! its read and exits without polling. The client side is abstracted as a
//! `Sink<Bytes>` plus a `Stream<Item = Result<Bytes, E>>` so the WebSocket
//! layer and the tests plug in the same way.

use std::fmt;

use axum::body::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::engine::{EngineResult, ExecAttachment};
use crate::metrics::metrics;
use crate::util::short_id;

/// Output post-processing applied before frames reach the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFilter {
    /// Forward every chunk as produced.
    #[default]
    PassThrough,
    /// Drop a chunk that is byte-identical to the one forwarded just before.
    SuppressAdjacentDuplicates,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Upper bound on a single client frame; larger output chunks are split.
    pub max_frame_bytes: usize,
    pub output_filter: OutputFilter,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: crate::config::DEFAULT_FRAME_BYTES,
            output_filter: OutputFilter::PassThrough,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Attached,
    Relaying,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Attached => "attached",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended: whichever pump stopped first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shell exited or the engine closed the attachment.
    ContainerExited,
    /// The client closed its connection.
    ClientClosed,
    ContainerError(String),
    ClientError(String),
    PumpPanicked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub bytes_to_client: u64,
    pub bytes_to_container: u64,
    pub state: SessionState,
}

/// What a pump hands back. `end` is `None` when it was cancelled.
struct PumpExit {
    end: Option<SessionEnd>,
    bytes: u64,
}

#[derive(Clone, Copy, Debug)]
enum Pump {
    Output,
    Input,
}

struct SessionLog {
    exec_id: String,
    state: SessionState,
}

impl SessionLog {
    fn advance(&mut self, next: SessionState) {
        tracing::debug!(
            exec_id = %short_id(&self.exec_id),
            from = %self.state,
            to = %next,
            "session state"
        );
        self.state = next;
    }
}

/// Relay between `attachment` and the client until either side ends.
///
/// Always returns with both pumps finished, the client sink closed and the
/// attachment's stdin and output stream dropped.
pub async fn run_session<S, C, E>(
    attachment: ExecAttachment,
    client_sink: S,
    client_stream: C,
    config: RelayConfig,
) -> SessionReport
where
    S: Sink<Bytes> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
    C: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let _guard = metrics().session_guard();
    let ExecAttachment {
        exec_id,
        output,
        input,
    } = attachment;
    let mut log = SessionLog {
        exec_id,
        state: SessionState::Attached,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut output_task = tokio::spawn(pump_output(
        output,
        client_sink,
        config,
        cancel_rx.clone(),
    ));
    let mut input_task = tokio::spawn(pump_input(client_stream, input, cancel_rx));
    log.advance(SessionState::Relaying);

    let (first_pump, first) = tokio::select! {
        res = &mut output_task => (Pump::Output, res),
        res = &mut input_task => (Pump::Input, res),
    };
    log.advance(SessionState::Closing);
    let _ = cancel_tx.send(true);

    let (second_pump, second) = match first_pump {
        Pump::Output => (Pump::Input, input_task.await),
        Pump::Input => (Pump::Output, output_task.await),
    };

    let first = settle(first_pump, first);
    let second = settle(second_pump, second);
    let (out_exit, in_exit) = match first_pump {
        Pump::Output => (first, second),
        Pump::Input => (second, first),
    };
    let default_end = match first_pump {
        Pump::Output => SessionEnd::ContainerExited,
        Pump::Input => SessionEnd::ClientClosed,
    };
    let end = match first_pump {
        Pump::Output => out_exit.end.clone(),
        Pump::Input => in_exit.end.clone(),
    }
    .unwrap_or(default_end);

    log.advance(SessionState::Closed);
    metrics().record_relayed(in_exit.bytes, out_exit.bytes);

    match &end {
        SessionEnd::ContainerError(err) | SessionEnd::ClientError(err) => tracing::warn!(
            exec_id = %short_id(&log.exec_id),
            error = %err,
            "session ended with error"
        ),
        SessionEnd::PumpPanicked => tracing::error!(
            exec_id = %short_id(&log.exec_id),
            "session pump panicked"
        ),
        _ => {}
    }
    tracing::info!(
        exec_id = %short_id(&log.exec_id),
        end = ?end,
        bytes_to_client = out_exit.bytes,
        bytes_to_container = in_exit.bytes,
        "session closed"
    );

    SessionReport {
        end,
        bytes_to_client: out_exit.bytes,
        bytes_to_container: in_exit.bytes,
        state: log.state,
    }
}

fn settle(pump: Pump, joined: Result<PumpExit, JoinError>) -> PumpExit {
    joined.unwrap_or_else(|err| {
        tracing::error!(?pump, error = %err, "relay pump failed");
        PumpExit {
            end: Some(SessionEnd::PumpPanicked),
            bytes: 0,
        }
    })
}

/// Split `chunk` into frames of at most `max` bytes. Zero-copy.
fn frames(chunk: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    let max = max.max(1);
    let len = chunk.len();
    (0..len)
        .step_by(max)
        .map(move |start| chunk.slice(start..(start + max).min(len)))
}

async fn pump_output<S>(
    mut output: BoxStream<'static, EngineResult<Bytes>>,
    mut sink: S,
    config: RelayConfig,
    mut cancel: watch::Receiver<bool>,
) -> PumpExit
where
    S: Sink<Bytes> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
{
    let mut last: Option<Bytes> = None;
    let mut sent = 0u64;

    let end = 'relay: loop {
        let next = tokio::select! {
            _ = cancel.changed() => break None,
            next = output.next() => next,
        };
        let chunk = match next {
            None => break Some(SessionEnd::ContainerExited),
            Some(Err(err)) => break Some(SessionEnd::ContainerError(err.to_string())),
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => chunk,
        };

        if config.output_filter == OutputFilter::SuppressAdjacentDuplicates {
            if last.as_ref() == Some(&chunk) {
                continue;
            }
            last = Some(chunk.clone());
        }

        for frame in frames(chunk, config.max_frame_bytes) {
            let len = frame.len() as u64;
            let result = tokio::select! {
                _ = cancel.changed() => break 'relay None,
                result = sink.send(frame) => result,
            };
            if let Err(err) = result {
                break 'relay Some(SessionEnd::ClientError(err.to_string()));
            }
            sent += len;
        }
    };

    let _ = sink.close().await;
    drop(output);
    PumpExit { end, bytes: sent }
}

async fn pump_input<C, E, W>(mut client: C, mut stdin: W, mut cancel: watch::Receiver<bool>) -> PumpExit
where
    C: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut received = 0u64;

    let end = loop {
        let next = tokio::select! {
            _ = cancel.changed() => break None,
            next = client.next() => next,
        };
        let bytes = match next {
            None => break Some(SessionEnd::ClientClosed),
            Some(Err(err)) => break Some(SessionEnd::ClientError(err.to_string())),
            Some(Ok(bytes)) if bytes.is_empty() => continue,
            Some(Ok(bytes)) => bytes,
        };

        let written = tokio::select! {
            _ = cancel.changed() => break None,
            written = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            } => written,
        };
        if let Err(err) = written {
            break Some(SessionEnd::ContainerError(format!("stdin write failed: {err}")));
        }
        received += bytes.len() as u64;
    };

    let _ = stdin.shutdown().await;
    drop(stdin);
    PumpExit {
        end,
        bytes: received,
    }
}
