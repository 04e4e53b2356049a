use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use oledlink_core::{init_logging, AppDirs, ChannelMode, Config, WorkerConfig};
use oledlink_display::DisplayPlugin;
use oledlink_worker::TracingSink;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(
    name = "oledlink",
    version,
    about = "Feed player state updates to an OLED display worker"
)]
struct Cli {
    /// Config file to use instead of config.toml in the platform config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the worker and forward one JSON player state per stdin line
    Run(RunCommand),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Parser, Clone, Default)]
struct RunCommand {
    /// Worker executable (overrides worker.executable)
    #[arg(long)]
    worker: Option<PathBuf>,
    /// How the worker's fd 0 is wired (overrides worker.channel)
    #[arg(long, value_enum)]
    channel: Option<ChannelArg>,
    /// Worker arguments (replace worker.args when given)
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChannelArg {
    Ipc,
    Stdio,
}

impl From<ChannelArg> for ChannelMode {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Ipc => ChannelMode::Ipc,
            ChannelArg::Stdio => ChannelMode::Stdio,
        }
    }
}

impl RunCommand {
    fn apply(&self, worker: &mut WorkerConfig) {
        if let Some(executable) = &self.worker {
            worker.executable = executable.clone();
        }
        if let Some(channel) = self.channel {
            worker.channel = channel.into();
        }
        if !self.args.is_empty() {
            worker.args = self.args.clone();
        }
    }
}

#[derive(Debug, Error)]
enum StateLineError {
    #[error("invalid player state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("player state must be a JSON object")]
    NotAnObject,
}

/// Parse one stdin line. Blank lines yield `None`.
///
/// The object is kept as the player wrote it so the worker sees every field.
fn parse_state_line(line: &str) -> Result<Option<Value>, StateLineError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(line)? {
        state @ Value::Object(_) => Ok(Some(state)),
        _ => Err(StateLineError::NotAnObject),
    }
}

fn load_config(cli: &Cli, dirs: &AppDirs) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load_or_default(dirs).context("failed to load config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = load_config(&cli, &dirs)?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Run(run) => {
            run.apply(&mut config.worker);
            config.validate()?;
            let _logging = init_logging(&config.logging, &dirs)?;
            run_plugin(config.worker).await?;
        }
    }

    Ok(())
}

async fn run_plugin(worker: WorkerConfig) -> Result<()> {
    tracing::info!(
        executable = %worker.executable.display(),
        channel = worker.channel.as_str(),
        "starting display worker"
    );
    let mut plugin = DisplayPlugin::new(worker, Arc::new(TracingSink::default()));
    plugin
        .on_start()
        .await
        .context("failed to start display worker")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_state_line(&line) {
                    Ok(Some(state)) => plugin.on_raw_state(state).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping stdin line"),
                },
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "reading stdin failed");
                    break;
                }
            },
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                }
                tracing::info!("interrupted");
                break;
            }
        }
    }

    plugin.on_stop().await.context("failed to stop display worker")?;
    Ok(())
}
