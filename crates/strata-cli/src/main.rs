mod wizard;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use strata_config::{AppConfig, ConfigLoader};
use strata_db::{CancelFlag, Engine, Operation, Scaffolder, SqliteExecutor, output};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Versioned schema migrations for SQLite")]
struct Cli {
    /// Path to the config file (.toml, .yml or .json). Falls back to $STRATA_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        global = true,
        env = "STRATA_LOG_FORMAT",
        default_value_t = LogFormat::Text
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a new config file interactively.
    Init {
        #[arg(default_value = "strata.toml")]
        path: PathBuf,
    },
    /// Create an empty up/down migration pair. Spaces become underscores.
    Make {
        #[arg(required = true, num_args = 1..)]
        description: Vec<String>,
    },
    /// Apply only the next up file.
    Up,
    /// Apply every pending up file.
    #[command(alias = "up-all")]
    All,
    /// Apply only the current down file.
    Down,
    /// Apply every down file, rolling the database back to empty.
    #[command(alias = "down-all")]
    Reset,
    /// Roll everything back, then apply everything.
    Refresh,
    /// Show the last applied migration.
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,strata=info,strata_db=info,strata_config=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_flag = cli.config.as_deref();
    match cli.command {
        Command::Init { path } => {
            wizard::run_wizard(&path)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Make { description } => {
            let config = load_config(config_flag)?;
            let pair = Scaffolder::new(&config.migration.folder, &config.migration.extension)
                .create(&description.join(" "))?;
            print!("{}", output::render_scaffold(&pair));
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let config = load_config(config_flag)?;
            let mut engine = open_engine(&config, CancelFlag::new())?;
            let report = engine.status()?;
            print!("{}", output::render_status(&report));
            Ok(ExitCode::SUCCESS)
        }
        Command::Up => migrate(load_config(config_flag)?, Operation::UpOne).await,
        Command::All => migrate(load_config(config_flag)?, Operation::UpAll).await,
        Command::Down => migrate(load_config(config_flag)?, Operation::DownOne).await,
        Command::Reset => migrate(load_config(config_flag)?, Operation::DownAll).await,
        Command::Refresh => migrate(load_config(config_flag)?, Operation::Refresh).await,
    }
}

fn load_config(flag: Option<&Path>) -> Result<AppConfig> {
    let path = ConfigLoader::resolve_path(flag)?;
    ConfigLoader::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

/// Run one engine operation off the async runtime; Ctrl-C stops it between steps.
async fn migrate(config: AppConfig, operation: Operation) -> Result<ExitCode> {
    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current migration");
            on_interrupt.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || {
        let mut engine = open_engine(&config, cancel)?;
        Ok::<_, strata_common::Error>(engine.run(operation))
    })
    .await
    .context("migration task panicked")??;

    print!("{}", output::render_run(&result));
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn open_engine(
    config: &AppConfig,
    cancel: CancelFlag,
) -> strata_common::Result<Engine<SqliteExecutor>> {
    let executor = open_executor(&config.database.path, &config.migration.table)?;
    Ok(Engine::new(executor, config.migration.folder.clone())
        .with_extension(config.migration.extension.clone())
        .with_cancel_flag(cancel))
}

fn open_executor(db_path: &Path, table: &str) -> strata_common::Result<SqliteExecutor> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    SqliteExecutor::open(db_path, table)
}
