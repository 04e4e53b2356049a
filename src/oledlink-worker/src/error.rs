use crate::codec::{DecodeError, EncodeError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures around the display worker.
///
/// `start`/`stop` return these to their caller. Everything that happens in
/// the background (exits, broken channels, bad frames) is reported to the
/// [`LogSink`](crate::LogSink) instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to set up worker channel: {0}")]
    ChannelSetup(std::io::Error),
    #[error("worker is already running or a restart is pending")]
    AlreadyRunning,
    #[error("worker channel is closed, {dropped} message(s) dropped")]
    ChannelClosed { dropped: usize },
    #[error("worker channel stayed full for {timeout:?}, message dropped")]
    SendTimeout { timeout: Duration },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("discarded frame from worker: {0}")]
    Decode(#[from] DecodeError),
    #[error("worker exited unexpectedly (code {code:?}, signal {signal:?})")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("worker was restarted {limit} times, giving up")]
    RestartLimit { limit: u32 },
    #[error("failed to wait for worker: {0}")]
    Wait(std::io::Error),
}

impl WorkerError {
    /// Errors that mean the message did not reach the worker.
    pub fn is_dropped_message(&self) -> bool {
        matches!(
            self,
            WorkerError::ChannelClosed { .. } | WorkerError::SendTimeout { .. }
        )
    }
}
