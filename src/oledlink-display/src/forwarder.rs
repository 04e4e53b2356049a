//! State forwarding for the display.
//!
//! Forwarding failures never reach the host: they are logged and handed to
//! the optional error callback.

use async_trait::async_trait;
use oledlink_core::PlaybackState;
use oledlink_worker::{ChildSupervisor, HostMessage, StateMessage, WorkerError};
use serde_json::Value;
use std::sync::Arc;

/// Type alias for error callbacks.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Anything that accepts messages for the display.
#[async_trait]
pub trait DisplayTarget: Send + Sync {
    async fn send(&self, message: HostMessage) -> Result<(), WorkerError>;
}

#[async_trait]
impl DisplayTarget for ChildSupervisor {
    async fn send(&self, message: HostMessage) -> Result<(), WorkerError> {
        ChildSupervisor::send(self, message).await
    }
}

/// Counters kept by [`StateForwarder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub forwarded: u64,
    pub failed: u64,
    /// Failures where the message never reached the worker.
    pub dropped: u64,
}

/// Forwards host state changes to a [`DisplayTarget`].
pub struct StateForwarder {
    target: Arc<dyn DisplayTarget>,
    enabled: bool,
    error_callback: Option<ErrorCallback>,
    stats: ForwarderStats,
}

impl std::fmt::Debug for StateForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateForwarder")
            .field("enabled", &self.enabled)
            .field("stats", &self.stats)
            .finish()
    }
}

impl StateForwarder {
    pub fn new(target: Arc<dyn DisplayTarget>) -> Self {
        Self {
            target,
            enabled: true,
            error_callback: None,
            stats: ForwarderStats::default(),
        }
    }

    /// Set a callback for error notifications.
    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.error_callback = Some(Box::new(callback));
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    /// Forward a typed playback state.
    pub async fn on_state_changed(&mut self, state: &PlaybackState) {
        if !self.enabled {
            return;
        }

        match StateMessage::from_state(state) {
            Ok(message) => self.forward(message).await,
            Err(e) => self.report(&WorkerError::Encode(e)),
        }
    }

    /// Forward the host's raw state object as is.
    pub async fn forward_value(&mut self, value: Value) {
        if !self.enabled {
            return;
        }
        self.forward(StateMessage::new(value)).await;
    }

    async fn forward(&mut self, message: StateMessage) {
        match self.target.send(HostMessage::State(message)).await {
            Ok(()) => {
                self.stats.forwarded += 1;
                tracing::trace!(forwarded = self.stats.forwarded, "state forwarded to display");
            }
            Err(e) => self.report(&e),
        }
    }

    fn report(&mut self, error: &WorkerError) {
        self.stats.failed += 1;
        if error.is_dropped_message() {
            self.stats.dropped += 1;
        }
        tracing::warn!(
            error = %error,
            failed = self.stats.failed,
            dropped = self.stats.dropped,
            "display state update failed"
        );

        if let Some(callback) = &self.error_callback {
            callback(&format!("Display update failed: {}", error));
        }
    }
}
