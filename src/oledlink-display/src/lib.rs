//! Display side of the plugin: turns host lifecycle hooks and state changes
//! into messages for the supervised worker.

pub mod forwarder;
pub mod plugin;

pub use forwarder::{DisplayTarget, ErrorCallback, ForwarderStats, StateForwarder};
pub use plugin::{DisplayPlugin, STOP_BANNER};
