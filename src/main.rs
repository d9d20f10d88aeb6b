use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use hostdeck::config::HostdeckConfig;
use hostdeck::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "hostdeck")]
#[command(version, about = "Push a git branch live behind a process supervisor")]
pub struct Cli {
    /// Path to hostdeck.toml. Defaults to $HOSTDECK_CONFIG, then .hostdeck/hostdeck.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter directive (e.g. "debug" or "hostdeck=debug,tower_http=warn")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the deploy server (HTTP API + WebSocket event streams)
    Serve {
        /// Interface to bind. Overrides [server].host
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on. Overrides [server].port
        #[arg(short, long)]
        port: Option<u16>,

        /// Open the server URL in a browser
        #[arg(long)]
        open: bool,

        /// Permissive CORS for a console served from another origin
        #[arg(long)]
        dev: bool,
    },
    /// Run one deploy in this process and print its events
    Deploy {
        /// Repository: owner/name, bare name, or clone URL
        #[arg(long)]
        repo: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Port the application listens on (1024-65535)
        #[arg(long)]
        port: i64,

        /// Supervisor process name. Defaults to the repository name
        #[arg(long)]
        name: Option<String>,

        /// Print raw JSON events, one per line
        #[arg(long)]
        json: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default hostdeck.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(
        cli.log_level.as_deref(),
        cli.log_format,
        cli.log_file.as_deref(),
    )?;

    match &cli.command {
        Commands::Serve {
            host,
            port,
            open,
            dev,
        } => {
            let config = HostdeckConfig::load_or_default(cli.config.as_deref())?;
            cmd::cmd_serve(config, host.clone(), *port, *open, *dev).await?;
        }
        Commands::Deploy {
            repo,
            branch,
            port,
            name,
            json,
        } => {
            let config = HostdeckConfig::load_or_default(cli.config.as_deref())?;
            let succeeded =
                cmd::cmd_deploy(config, repo, branch, *port, name.as_deref(), *json).await?;
            if !succeeded {
                // Return rather than exit so `_log_guard` flushes the log file.
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Config { command } => {
            cmd::cmd_config(cli.config.as_deref(), command.clone())?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
