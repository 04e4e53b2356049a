//! Where worker output and background failures end up.

use crate::error::WorkerError;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One line of diagnostic text captured from the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub timestamp: SystemTime,
    pub stream: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stream,
            text: text.into(),
        }
    }

    /// Build a line from raw bytes, dropping the line ending and replacing
    /// invalid UTF-8.
    pub fn from_bytes(stream: StreamKind, raw: &[u8]) -> Self {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Self::new(stream, String::from_utf8_lossy(raw).into_owned())
    }
}

/// Consumer of worker output. Called concurrently from the reader tasks.
pub trait LogSink: Send + Sync {
    fn line(&self, line: OutputLine);

    fn failure(&self, error: &WorkerError) {
        tracing::warn!(error = %error, "display worker failure");
    }
}

impl<F> LogSink for F
where
    F: Fn(OutputLine) + Send + Sync,
{
    fn line(&self, line: OutputLine) {
        self(line)
    }
}

/// Default sink: re-emits worker output as tracing events.
#[derive(Debug, Clone)]
pub struct TracingSink {
    worker: String,
}

impl TracingSink {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new("display")
    }
}

impl LogSink for TracingSink {
    fn line(&self, line: OutputLine) {
        match line.stream {
            StreamKind::Stdout => {
                tracing::info!(worker = %self.worker, stream = "stdout", "{}", line.text)
            }
            StreamKind::Stderr => {
                tracing::warn!(worker = %self.worker, stream = "stderr", "{}", line.text)
            }
        }
    }

    fn failure(&self, error: &WorkerError) {
        tracing::error!(worker = %self.worker, error = %error, "display worker failure");
    }
}
