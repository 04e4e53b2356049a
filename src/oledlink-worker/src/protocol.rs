//! Message types exchanged with the display worker.
//!
//! Every frame is a single JSON object on its own line:
//!
//! ```text
//! {"seq":1,"message":{"type":"State","params":{"status":"play","title":"..."}}}
//! {"seq":2,"message":{"type":"Banner","params":{"text":"Stopping..."}}}
//! ```
//!
//! The worker may answer on the same channel with [`WorkerFrame`]s.

use crate::codec::EncodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised to the worker via `OLEDLINK_PROTOCOL`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Snapshot of the player state, forwarded as-is to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMessage(Value);

impl StateMessage {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Build a message from any serializable state object.
    pub fn from_state<T: Serialize + ?Sized>(state: &T) -> Result<Self, EncodeError> {
        Ok(Self(serde_json::to_value(state)?))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for StateMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Messages sent from the plugin to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum HostMessage {
    /// A new playback state to render.
    State(StateMessage),
    /// Replace the display with a text banner (e.g. "Stopping...").
    Banner { text: String },
}

/// Envelope written to the worker; `seq` counts frames per channel from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFrame {
    pub seq: u64,
    pub message: HostMessage,
}

/// Messages the worker may send back over the IPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum WorkerMessage {
    /// The worker finished initializing its display.
    Ready { protocol_version: u32 },
    /// The worker rendered the frame with this sequence number.
    Ack { seq: u64 },
    /// Structured log output that should not go through stderr.
    Log { level: String, message: String },
    /// A request for the host, e.g. a button press on the display board.
    Command {
        name: String,
        #[serde(default)]
        args: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub message: WorkerMessage,
}
