pub mod config;
pub mod logging;
pub mod models;
pub mod paths;

pub use config::{
    ChannelMode, Config, ConfigError, LogLevel, LoggingConfig, RestartConfig, RestartPolicy,
    ValidationError, WorkerConfig,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use models::{PlaybackState, PlaybackStatus};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "oledlink";
pub const APP_AUTHOR: &str = "oledlink";
pub const APP_QUALIFIER: &str = "io";
