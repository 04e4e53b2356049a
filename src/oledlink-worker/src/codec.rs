//! Newline-delimited JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Frames longer than this are discarded instead of buffered.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[error("failed to encode frame: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the frame size limit")]
    FrameTooLarge { len: usize },
    #[error("channel closed in the middle of a {len} byte frame")]
    Truncated { len: usize },
}

/// Encode `value` as one JSON line terminated by `\n`.
///
/// serde_json escapes control characters inside strings, so the only raw
/// newline in the output is the terminator.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut frame = serde_json::to_vec(value)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame, with or without its line terminator.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, DecodeError> {
    let body = strip_line_ending(frame);
    if body.len() > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge { len: body.len() });
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(body)?)
}

fn strip_line_ending(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

/// Reassembles frames from arbitrarily split reads.
///
/// At most one partial frame is held between calls.
#[derive(Debug)]
pub struct FrameBuffer {
    partial: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Feed a chunk of bytes and collect every frame it completes.
    ///
    /// Blank lines are skipped. An oversized frame yields a single
    /// `FrameTooLarge` and is dropped up to its terminating newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, DecodeError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            let len = self.partial.len() + line.len();
            if len > self.max_len {
                self.partial.clear();
                frames.push(Err(DecodeError::FrameTooLarge { len }));
                continue;
            }
            self.partial.extend_from_slice(line);
            let frame = std::mem::take(&mut self.partial);
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            frames.push(Ok(frame));
        }

        if !rest.is_empty() && !self.discarding {
            let len = self.partial.len() + rest.len();
            if len > self.max_len {
                self.partial.clear();
                self.discarding = true;
                frames.push(Err(DecodeError::FrameTooLarge { len }));
            } else {
                self.partial.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Bytes of the frame currently being assembled.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Called at end of stream; reports a frame that never got its newline.
    pub fn finish(&mut self) -> Option<DecodeError> {
        self.discarding = false;
        let partial = std::mem::take(&mut self.partial);
        if partial.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(DecodeError::Truncated { len: partial.len() })
        }
    }
}
