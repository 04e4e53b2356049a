//! Host plugin context.
//!
//! [`DisplayPlugin`] owns the worker supervisor for the lifetime of one
//! start/stop cycle of the host.

use crate::forwarder::{ForwarderStats, StateForwarder};
use oledlink_core::{PlaybackState, WorkerConfig};
use oledlink_worker::{
    ChildSupervisor, HostMessage, LogSink, SupervisorConfig, WorkerError, WorkerSpec,
};
use serde_json::Value;
use std::sync::Arc;

/// Banner shown on the display while the plugin shuts down.
pub const STOP_BANNER: &str = "Stopping...";

pub struct DisplayPlugin {
    config: WorkerConfig,
    sink: Arc<dyn LogSink>,
    session: Option<Session>,
}

struct Session {
    supervisor: ChildSupervisor,
    forwarder: StateForwarder,
}

impl std::fmt::Debug for DisplayPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayPlugin")
            .field("executable", &self.config.executable)
            .field("channel", &self.config.channel)
            .field(
                "supervisor",
                &self.session.as_ref().map(|session| &session.supervisor),
            )
            .finish()
    }
}

impl DisplayPlugin {
    pub fn new(config: WorkerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            sink,
            session: None,
        }
    }

    /// Spawn the display worker. Returns its pid.
    pub async fn on_start(&mut self) -> Result<u32, WorkerError> {
        if self.session.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        let supervisor =
            ChildSupervisor::new(SupervisorConfig::from(&self.config), self.sink.clone());
        let pid = supervisor.start(WorkerSpec::from(&self.config)).await?;
        let forwarder = StateForwarder::new(Arc::new(supervisor.clone()));
        self.session = Some(Session {
            supervisor,
            forwarder,
        });
        tracing::info!(pid, "display plugin started");
        Ok(pid)
    }

    /// Forward a state change. Ignored while the plugin is stopped.
    pub async fn on_state_changed(&mut self, state: &PlaybackState) {
        if let Some(session) = self.session.as_mut() {
            session.forwarder.on_state_changed(state).await;
        }
    }

    /// Forward the host's raw state object. Ignored while the plugin is
    /// stopped.
    pub async fn on_raw_state(&mut self, state: Value) {
        if let Some(session) = self.session.as_mut() {
            session.forwarder.forward_value(state).await;
        }
    }

    /// Show the stop banner, then stop the worker and release it.
    pub async fn on_stop(&mut self) -> Result<(), WorkerError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let banner = HostMessage::Banner {
            text: STOP_BANNER.to_string(),
        };
        if let Err(e) = session.supervisor.send(banner).await {
            tracing::debug!(error = %e, "stop banner not delivered");
        }

        let stats = session.forwarder.stats();
        session.supervisor.stop().await?;
        tracing::info!(
            forwarded = stats.forwarded,
            failed = stats.failed,
            dropped = stats.dropped,
            "display plugin stopped"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    pub fn supervisor(&self) -> Option<&ChildSupervisor> {
        self.session.as_ref().map(|session| &session.supervisor)
    }

    /// Forwarding counters for the current session.
    pub fn stats(&self) -> Option<ForwarderStats> {
        self.session.as_ref().map(|session| session.forwarder.stats())
    }

    /// Enable or disable forwarding for the current session.
    pub fn set_forwarding(&mut self, enabled: bool) {
        if let Some(session) = self.session.as_mut() {
            session.forwarder.set_enabled(enabled);
        }
    }
}
