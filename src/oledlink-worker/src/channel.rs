//! Ordered, bounded message channel to the worker.
//!
//! The channel is transport agnostic: the supervisor hands it one half of a
//! socket pair or the worker's stdin, tests hand it a `tokio::io::duplex`.

use crate::codec::{decode, encode, EncodeError, FrameBuffer};
use crate::error::WorkerError;
use crate::protocol::{HostMessage, WorkerFrame, WorkerMessage};
use crate::sink::LogSink;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;

/// Callback for frames the worker sends back.
pub type InboundHandler = Arc<dyn Fn(WorkerFrame) + Send + Sync>;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Frames that may wait for the writer before `send` starts blocking.
    pub capacity: usize,
    /// How long `send` waits for queue space before dropping the message.
    pub send_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            send_timeout: Duration::from_millis(500),
        }
    }
}

/// What the writer task managed to do before it finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub written: u64,
    pub dropped: usize,
}

/// Frames accepted by `send` versus frames the writer has settled, so a
/// cancelled writer can still account for its queue.
#[derive(Debug, Default)]
struct Backlog {
    accepted: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl Backlog {
    fn unsettled(&self) -> u64 {
        self.accepted
            .load(Ordering::SeqCst)
            .saturating_sub(self.written.load(Ordering::SeqCst))
            .saturating_sub(self.dropped.load(Ordering::SeqCst))
    }
}

/// Sending side of the worker channel. Cheap to clone; the writer shuts the
/// transport down once every clone is dropped and the queue is flushed.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    tx: mpsc::Sender<HostMessage>,
    send_timeout: Duration,
    backlog: Arc<Backlog>,
}

/// Handle on the writer task returned by [`MessageChannel::open`].
pub struct ChannelWriter {
    task: JoinHandle<WriterReport>,
    backlog: Arc<Backlog>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("finished", &self.task.is_finished())
            .field("backlog", &self.backlog)
            .finish()
    }
}

impl ChannelWriter {
    /// Wait up to `timeout` for the writer to flush and finish.
    ///
    /// A writer that is still busy afterwards is cancelled, and every frame it
    /// never wrote is reported to the sink as `ChannelClosed`.
    pub async fn close(mut self, timeout: Duration) -> WriterReport {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(report)) => return report,
            Ok(Err(err)) => tracing::warn!(error = %err, "display worker channel writer failed"),
            Err(_) => {
                tracing::warn!("display worker channel did not flush in time");
                self.task.abort();
            }
        }

        let unsettled = self.backlog.unsettled() as usize;
        if unsettled > 0 {
            self.sink
                .failure(&WorkerError::ChannelClosed { dropped: unsettled });
        }
        WriterReport {
            written: self.backlog.written.load(Ordering::SeqCst),
            dropped: self.backlog.dropped.load(Ordering::SeqCst) as usize + unsettled,
        }
    }

    /// Cancel the writer without accounting for its queue.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl MessageChannel {
    /// Start the writer task over `writer`.
    pub fn open<W>(
        writer: W,
        options: ChannelOptions,
        sink: Arc<dyn LogSink>,
    ) -> (Self, ChannelWriter)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let backlog = Arc::new(Backlog::default());
        let task = tokio::spawn(write_frames(writer, rx, sink.clone(), backlog.clone()));
        (
            Self {
                tx,
                send_timeout: options.send_timeout,
                backlog: backlog.clone(),
            },
            ChannelWriter {
                task,
                backlog,
                sink,
            },
        )
    }

    /// Queue a message. Frames reach the worker in the order they were queued.
    pub async fn send(&self, message: HostMessage) -> Result<(), WorkerError> {
        // Counted before queueing: the writer may settle the frame first.
        self.backlog.accepted.fetch_add(1, Ordering::SeqCst);
        let result = self.tx.send_timeout(message, self.send_timeout).await;
        if result.is_err() {
            self.backlog.accepted.fetch_sub(1, Ordering::SeqCst);
        }
        match result {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(WorkerError::SendTimeout {
                timeout: self.send_timeout,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(WorkerError::ChannelClosed { dropped: 1 }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<HostMessage>,
    sink: Arc<dyn LogSink>,
    backlog: Arc<Backlog>,
) -> WriterReport
where
    W: AsyncWrite + Unpin,
{
    let mut report = WriterReport::default();
    let mut sequencer = Sequencer::default();

    while let Some(message) = rx.recv().await {
        let (seq, frame) = match sequencer.frame(&message) {
            Ok(framed) => framed,
            Err(err) => {
                sink.failure(&WorkerError::Encode(err));
                report.dropped += 1;
                backlog.dropped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
        };

        if let Err(err) = write_frame(&mut writer, &frame).await {
            rx.close();
            let mut dropped = 1;
            while rx.recv().await.is_some() {
                dropped += 1;
            }
            tracing::warn!(seq, dropped, error = %err, "write to display worker failed");
            sink.failure(&WorkerError::ChannelClosed { dropped });
            report.dropped += dropped;
            backlog.dropped.fetch_add(dropped as u64, Ordering::SeqCst);
            return report;
        }

        report.written += 1;
        backlog.written.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(seq, "frame written to display worker");
    }

    if let Err(err) = writer.shutdown().await {
        tracing::debug!(error = %err, "closing display worker channel failed");
    }
    report
}

/// Wire shape of [`HostFrame`](crate::protocol::HostFrame), borrowing the
/// message.
#[derive(Serialize)]
struct OutgoingFrame<'a, M> {
    seq: u64,
    message: &'a M,
}

/// Hands out `seq` numbers; a frame that fails to encode does not use one up.
#[derive(Debug, Default)]
struct Sequencer {
    last: u64,
}

impl Sequencer {
    fn frame<M: Serialize>(&mut self, message: &M) -> Result<(u64, Vec<u8>), EncodeError> {
        let seq = self.last + 1;
        let frame = encode(&OutgoingFrame { seq, message })?;
        self.last = seq;
        Ok((seq, frame))
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read frames from the worker until its end of the channel closes.
///
/// Malformed frames are reported to the sink and skipped; the channel stays
/// open.
pub fn spawn_inbound_reader<R>(
    reader: R,
    sink: Arc<dyn LogSink>,
    handler: Option<InboundHandler>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(read_frames(reader, sink, handler))
}

async fn read_frames<R>(mut reader: R, sink: Arc<dyn LogSink>, handler: Option<InboundHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(error = %err, "reading from display worker channel failed");
                break;
            }
        };

        for frame in frames.push(&chunk[..n]) {
            match frame.and_then(|raw| decode::<WorkerFrame>(&raw)) {
                Ok(frame) => dispatch(frame, handler.as_ref()),
                Err(err) => sink.failure(&WorkerError::Decode(err)),
            }
        }
    }

    if let Some(err) = frames.finish() {
        sink.failure(&WorkerError::Decode(err));
    }
}

fn dispatch(frame: WorkerFrame, handler: Option<&InboundHandler>) {
    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    match &frame.message {
        WorkerMessage::Ready { protocol_version } => {
            tracing::info!(protocol_version, "display worker ready")
        }
        WorkerMessage::Ack { seq } => tracing::trace!(seq, "display worker ack"),
        WorkerMessage::Log { level, message } => match level.as_str() {
            "error" => tracing::error!(target: "display_worker", "{}", message),
            "warn" | "warning" => tracing::warn!(target: "display_worker", "{}", message),
            "debug" => tracing::debug!(target: "display_worker", "{}", message),
            _ => tracing::info!(target: "display_worker", "{}", message),
        },
        WorkerMessage::Command { name, .. } => {
            tracing::debug!(command = %name, "unhandled display worker command")
        }
    }
}
