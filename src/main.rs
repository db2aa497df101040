//! Allowgate CLI - manage and serve a proxy's player allow-list

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use allowgate::client::AdminClient;
use allowgate::config::{self, RemoteSettings};
use allowgate::migration::{self, Pipeline};
use allowgate::operator::{Command, CONSOLE};
use allowgate::repository::Repository;
use allowgate::ui::{self, Icons};
use allowgate::{App, storage};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "allowgate")]
#[command(version)]
#[command(about = "Player allow-list for a proxy network, on SQLite or MySQL")]
#[command(long_about = r#"
Allowgate keeps the list of players allowed through a proxy and answers
the proxy's preconnect check from an in-memory snapshot.

Example usage:
  allowgate add Alice
  allowgate list
  allowgate serve --bind 127.0.0.1:8765
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding allowgate.toml and the SQLite file
    #[arg(short, long, global = true, default_value = "allowgate")]
    data_dir: PathBuf,

    /// Address of a running `allowgate serve` (defaults to remote.bind)
    #[arg(long, global = true)]
    server: Option<SocketAddr>,

    /// Apply changes to the store directly, even if a server is running
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a player to the whitelist
    Add {
        /// Player name
        name: String,
    },

    /// Remove a player from the whitelist
    Remove {
        /// Player name
        name: String,
    },

    /// List whitelisted players
    List,

    /// Remove every player (requires enable_clear_command)
    Clear,

    /// Turn enforcement on
    Enable,

    /// Turn enforcement off
    Disable,

    /// Show whether enforcement is on, plus backend details
    Status,

    /// Re-read the config and reload the whitelist from the store
    Reload,

    /// Ask the gate whether a player may connect
    Check {
        /// Player name
        name: String,
    },

    /// Upgrade the config and import old files, then exit
    Migrate,

    /// Serve the preconnect check and the remote add/remove channel over HTTP
    Serve {
        /// Listen address (defaults to remote.bind)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::Migrate = cli.command {
        return migrate(cli.data_dir).await;
    }

    if let Some(command) = cli.command.operator_command() {
        if !cli.local {
            if let Some(addr) = cli.server.or_else(|| configured_bind(&cli.data_dir)) {
                if let Some(reply) = AdminClient::new(addr)?.send(&command).await? {
                    ui::reply(&reply);
                    return Ok(());
                }
                tracing::debug!("No server at {}, applying locally", addr);
            }
        }
    }

    let app = App::start(cli.data_dir).await;
    let result = run(&app, cli.command).await;
    app.shutdown().await;
    result
}

impl Commands {
    /// The commands that change state, which a running server must apply itself
    fn operator_command(&self) -> Option<Command> {
        match self {
            Commands::Add { name } => Some(Command::Add(name.clone())),
            Commands::Remove { name } => Some(Command::Remove(name.clone())),
            Commands::Clear => Some(Command::Clear),
            Commands::Enable => Some(Command::Enable),
            Commands::Disable => Some(Command::Disable),
            Commands::Reload => Some(Command::Reload),
            _ => None,
        }
    }
}

/// `remote.bind` from the config on disk, or the default when there is none yet
fn configured_bind(data_dir: &Path) -> Option<SocketAddr> {
    let bind = config::load_settings(&config::config_path_in(data_dir))
        .map(|s| s.remote.bind)
        .unwrap_or_else(|_| RemoteSettings::default().bind);
    bind.parse().ok()
}

async fn run(app: &App, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List => {
            let operator = app.operator()?;
            let entries = operator.repository().entries().await;
            if entries.is_empty() {
                ui::reply(&operator.list(CONSOLE).await);
            } else {
                println!("{}", ui::entries_table(&entries));
                ui::summary_row("Players:", &entries.len().to_string());
            }
        }

        Commands::Status => status(app).await,

        Commands::Check { name } => ui::decision(&name, &app.gate().check(&name).await),

        Commands::Migrate => migrate(app.data_dir().to_path_buf()).await?,

        Commands::Serve { bind } => {
            if let Some(reason) = app.init_error() {
                ui::warn(&format!("Serving without a whitelist: {}", reason));
            }
            let addr = match bind {
                Some(addr) => addr,
                None => {
                    let bind = app.settings().read(|s| s.remote.bind.clone());
                    bind.parse::<SocketAddr>()
                        .with_context(|| format!("invalid remote.bind address {:?}", bind))?
                }
            };
            allowgate::server::start_server(addr, app.server_state()).await?;
        }

        other => {
            if let Some(command) = other.operator_command() {
                ui::reply(&app.operator()?.execute(CONSOLE, &command).await);
            }
        }
    }

    Ok(())
}

async fn status(app: &App) {
    ui::header("Allowgate");
    if let Some(reason) = app.init_error() {
        ui::error(&format!("Whitelist unavailable: {}", reason));
    }
    if let Ok(operator) = app.operator() {
        ui::reply(&operator.status(CONSOLE));
    }

    let settings = app.settings().snapshot();
    let players = match app.repository() {
        Ok(repository) => repository.len().await.to_string(),
        Err(_) => "-".to_string(),
    };
    let version = settings.config_version.to_string();
    let data_dir = app.data_dir().display().to_string();
    let remote = if settings.remote.enabled {
        settings.remote.bind.clone()
    } else {
        "off".to_string()
    };

    ui::section(&format!("{} Details", Icons::STATS));
    println!(
        "{}",
        ui::settings_table(&[
            ("Enabled", if settings.enabled { "yes" } else { "no" }),
            ("Backend", settings.database.kind.as_str()),
            ("Players", players.as_str()),
            ("Config version", version.as_str()),
            ("Remote channel", remote.as_str()),
            ("Data directory", data_dir.as_str()),
        ])
    );
}

async fn migrate(data_dir: PathBuf) -> anyhow::Result<()> {
    ui::header("Migrating");
    let (settings, report) = Pipeline::new(&data_dir).run().await?;

    if report.created_config {
        ui::success("Created a default config");
    }
    if report.legacy_config_imported {
        ui::success("Imported the old flat config");
    }
    if report.steps.is_empty() {
        ui::info("Config version", &settings.config_version.to_string());
    } else {
        for step in &report.steps {
            ui::summary_row(&format!("{} v{} →", Icons::GEAR, step.from()), &format!("v{}", step.to()));
        }
    }

    let store = storage::open(&settings.database, &data_dir).await?;
    let repository = Arc::new(Repository::new(store));
    match migration::import_legacy_allowlist(&data_dir, &repository).await? {
        Some(import) => {
            ui::section(&format!("{} Whitelist import", Icons::PERSON));
            ui::summary_row("Entries:", &import.total.to_string());
            ui::summary_row("Migrated:", &import.migrated.to_string());
            ui::summary_row("Already present:", &import.skipped.to_string());
            ui::summary_row("Invalid:", &import.invalid.to_string());
            ui::summary_row("Failed:", &import.failed.to_string());
            match import.backup {
                Some(backup) => ui::summary_row("Backup:", &backup.display().to_string()),
                None => ui::warn("Some entries failed, the old file was kept for another try"),
            }
        }
        None => ui::info("Whitelist import", &ui::dim("nothing to import")),
    }
    repository.shutdown().await;

    ui::success("Migration complete");
    Ok(())
}
