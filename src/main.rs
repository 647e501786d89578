mod child;
mod command;
mod config;
mod paths;
mod prepare;
mod signals;
mod supervisor;

use child::Spawner;
use clap::Parser;
use command::ServerCommand;
use config::LauncherConfig;
use serde::Serialize;
use signals::ShutdownSignal;
use std::path::{Path, PathBuf};
use supervisor::{Supervisor, Timings};
use tokio::sync::mpsc;

/// Launches the SQLite MCP server (`uvx mcp-server-sqlite <db>`) as a
/// supervised child: prepares the database file, relays shutdown signals
/// and exits with the server's exit code.
#[derive(Parser, Debug)]
#[command(name = "sqlite-mcp-launcher", version, about)]
pub struct Cli {
    /// Database file (default: database.db next to the launcher)
    #[arg(value_name = "DB_PATH")]
    db_path: Option<String>,

    /// Launcher config file (default: launcher.toml next to the launcher, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the resolved launch plan as JSON and exit without spawning
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

/// Everything needed to start the server, as shown by `--dry-run`.
#[derive(Debug, Serialize)]
struct LaunchPlan {
    db_path: PathBuf,
    install_dir: PathBuf,
    command: ServerCommand,
    startup_notice_ms: u64,
    grace_period_ms: u64,
    #[serde(skip)]
    timings: Timings,
}

impl LaunchPlan {
    fn build(cli: &Cli, install_dir: &Path, cwd: &Path) -> Result<Self, config::ConfigError> {
        let config = LauncherConfig::resolve(cli.config.as_deref(), install_dir)?;
        let db_path = paths::resolve_db_path(
            cli.db_path.as_deref(),
            install_dir,
            &config.database.file_name,
            cwd,
        );
        let command = ServerCommand::sqlite_server(&config, install_dir, &db_path);
        Ok(Self {
            db_path,
            install_dir: install_dir.to_path_buf(),
            command,
            startup_notice_ms: config.startup.notice_delay_ms,
            grace_period_ms: config.shutdown.grace_period_ms,
            timings: Timings {
                startup_notice: config.startup.notice_delay(),
                grace_period: config.shutdown.grace_period(),
            },
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // stdout belongs to the server's protocol stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(%location, "unhandled panic: {}", panic_message(info.payload()));
        std::process::exit(supervisor::FAILURE_EXIT_CODE);
    }));

    tracing::debug!(?cli, "parsed CLI arguments");

    std::process::exit(exit_code(run(&cli).await));
}

/// Map the outcome of `run` to the process exit code, logging any error.
fn exit_code(result: Result<i32, Box<dyn std::error::Error>>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            supervisor::FAILURE_EXIT_CODE
        }
    }
}

/// Text of a panic payload; `panic!` produces either `&str` or `String`.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

async fn run(cli: &Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let install_dir = paths::install_dir();
    let cwd = std::env::current_dir()?;
    let plan = LaunchPlan::build(cli, &install_dir, &cwd)?;

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    let signals = signals::install()?;
    launch(&plan, child::TokioSpawner, signals).await
}

/// Prepare the database file, then spawn and supervise the server.
///
/// Nothing is spawned if preparation fails.
async fn launch<S: Spawner>(
    plan: &LaunchPlan,
    spawner: S,
    signals: mpsc::Receiver<ShutdownSignal>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let prepared = prepare::ensure_database_file(&plan.db_path)?;
    tracing::debug!(
        created_dir = prepared.created_dir,
        created_file = prepared.created_file,
        "database file ready"
    );

    tracing::info!(
        db = %plan.db_path.display(),
        "starting SQLite MCP server with database"
    );

    let mut supervisor = Supervisor::new(spawner, plan.timings);
    let termination = supervisor.run(&plan.command, signals).await;
    tracing::debug!(
        exit_code = termination.exit_code,
        state = %supervisor.state(),
        "supervisor finished"
    );

    Ok(termination.exit_code)
}
