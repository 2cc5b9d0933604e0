use anyhow::Result;
use clap::{Parser, Subcommand};
use reelsmith::common::JobId;
use reelsmith::config::Config;
use reelsmith::telemetry::{LogFormat, init_logging};
use std::path::PathBuf;

mod cmd;

const DEFAULT_SERVER: &str = "http://127.0.0.1:3141";

#[derive(Parser)]
#[command(name = "reelsmith")]
#[command(version, about = "Brief-to-video job orchestrator")]
pub struct Cli {
    /// Path to reelsmith.toml (defaults to ./reelsmith.toml)
    #[arg(long, global = true, env = "REELSMITH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format: text, json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the job gateway
    Serve {
        /// Port to serve on (overrides config and REELSMITH_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Run one brief locally and show its progress
    Run {
        /// Path to the brief (JSON)
        brief: PathBuf,

        /// Working directory for job artifacts
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Submit a brief to a running gateway
    Submit {
        /// Path to the brief (JSON)
        brief: PathBuf,

        /// Gateway base URL
        #[arg(long, default_value = DEFAULT_SERVER, env = "REELSMITH_SERVER")]
        server: String,

        /// Keep polling until the job finishes
        #[arg(long)]
        watch: bool,
    },
    /// Follow a job on a running gateway until it finishes or stalls
    Watch {
        job_id: JobId,

        /// Gateway base URL
        #[arg(long, default_value = DEFAULT_SERVER, env = "REELSMITH_SERVER")]
        server: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "2000")]
        interval_ms: u64,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
    /// Write a default reelsmith.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(&mut config, port, host, dev).await?;
        }
        Commands::Run { brief, work_dir, ui } => {
            if let Some(dir) = work_dir {
                config.toml.paths.work_dir = dir;
            }
            cmd::cmd_run(&config, &brief, ui.parse().unwrap_or_default()).await?;
        }
        Commands::Submit {
            brief,
            server,
            watch,
        } => cmd::cmd_submit(&brief, &server, watch).await?,
        Commands::Watch {
            job_id,
            server,
            interval_ms,
            ui,
        } => {
            cmd::cmd_watch(
                &server,
                job_id,
                std::time::Duration::from_millis(interval_ms),
                ui.parse().unwrap_or_default(),
            )
            .await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
