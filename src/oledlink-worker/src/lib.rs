//! Supervision of the external display worker.
//!
//! This crate provides:
//! - [`ChildSupervisor`], which spawns the worker, watches it and restarts it
//!   according to the configured [`RestartPolicy`](oledlink_core::RestartPolicy)
//! - [`MessageChannel`], an ordered, bounded frame writer usable over any
//!   async byte stream
//! - newline-delimited JSON framing in [`codec`]
//! - [`LogSink`], the injected consumer of worker stdout/stderr and of
//!   background failures
//!
//! # Channels
//!
//! The worker has two logically separate channels:
//! - fd 0 carries frames. In `ipc` mode it is one end of a Unix socket pair so
//!   the worker can answer on the same descriptor; in `stdio` mode it is a
//!   plain pipe.
//! - stdout and stderr carry diagnostic text only; each line becomes an
//!   [`OutputLine`].
//!
//! # Example worker (pseudocode)
//!
//! ```text
//! for line in fd0:
//!     frame = json_parse(line)
//!     if frame.message.type == "State":
//!         render(frame.message.params)
//!         write(fd0, {"message": {"type": "Ack", "params": {"seq": frame.seq}}})
//! exit(0)   # fd 0 reached EOF: the plugin is stopping
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use oledlink_worker::{ChildSupervisor, SupervisorConfig, TracingSink, WorkerSpec};
//! use std::sync::Arc;
//!
//! let supervisor = ChildSupervisor::new(SupervisorConfig::default(), Arc::new(TracingSink::default()));
//! supervisor.start(WorkerSpec::new("/usr/bin/python3").arg("oled_display.py")).await?;
//! supervisor.send_state(state).await?;
//! supervisor.stop().await?;
//! ```

mod channel;
pub mod codec;
mod error;
pub mod protocol;
mod restart;
mod sink;
mod supervisor;

pub use channel::{
    spawn_inbound_reader, ChannelOptions, ChannelWriter, InboundHandler, MessageChannel,
    WriterReport,
};
pub use codec::{decode, encode, DecodeError, EncodeError, FrameBuffer, MAX_FRAME_LEN};
pub use error::WorkerError;
pub use oledlink_core::{ChannelMode, RestartConfig, RestartPolicy};
pub use protocol::{
    HostFrame, HostMessage, StateMessage, WorkerFrame, WorkerMessage, PROTOCOL_VERSION,
};
pub use restart::{restart_delay, wants_restart};
pub use sink::{LogSink, OutputLine, StreamKind, TracingSink};
pub use supervisor::{
    ChildSupervisor, ExitObserver, ExitReport, SupervisorConfig, WorkerProcess, WorkerSpec,
    WorkerState, CHANNEL_ENV, PROTOCOL_ENV,
};
