//! RYTHM Database Backup Service
//!
//! Scheduled and on-demand PostgreSQL backups stored in S3-compatible object
//! storage, with restore, retention and an audit trail.

// rythm-backup/src/main.rs
mod admin;
mod audit;
mod backup;
mod config;
mod errors;
mod notify;
mod restore;
mod schedule;
mod utils;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use admin::{AdminCaller, AdminConsole, ScheduleChange};
use audit::PgAuditStore;
use backup::db_dump::PgDumpInvoker;
use backup::object_store::{BlobReader, S3ObjectStore};
use backup::run_lock::PgAdvisoryLock;
use backup::BackupService;
use config::{AppConfig, DatabaseConfig};
use notify::NotificationDispatcher;
use restore::db_restore::PsqlRestoreInvoker;
use schedule::BackupScheduler;

const NOTIFICATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(author, version, about = "Database backup and restore for the RYTHM platform")]
struct Cli {
    /// Optional JSON config file; environment variables take precedence.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Operator user id recorded in the backup history.
    #[arg(long, global = true)]
    user_id: Option<Uuid>,

    /// Operator email address for manual backup notifications.
    #[arg(long, global = true)]
    email: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup scheduler until interrupted
    Serve,
    /// Take a backup now
    Backup,
    /// List stored backups, newest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Restore a backup over the live database
    Restore {
        filename: String,
        /// Required: the restore overwrites current data
        #[arg(long)]
        confirm: bool,
    },
    /// Delete a stored backup
    Delete { filename: String },
    /// Download a stored backup to a local file
    Download {
        filename: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show or change the backup schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Show recent backup attempts
    History {
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    Show,
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        /// UTC time of day, HH:MM or HH:MM:SS
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        retention_days: Option<i32>,
    },
}

/// Main entry point for the backup service
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app(Cli::parse()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn connect_pool(database: &DatabaseConfig) -> PgPool {
    let mut options = PgConnectOptions::new()
        .host(&database.host)
        .port(database.port)
        .database(&database.database)
        .username(&database.user);
    if let Some(password) = &database.password {
        options = options.password(password);
    }
    PgPoolOptions::new().max_connections(5).connect_lazy_with(options)
}

struct Components {
    console: AdminConsole,
    scheduler: Arc<BackupScheduler>,
    pool: PgPool,
}

async fn build_components(app_config: &AppConfig) -> Components {
    let pool = connect_pool(&app_config.database);
    let audit_store = Arc::new(PgAuditStore::new(pool.clone()));
    let object_store = Arc::new(S3ObjectStore::connect(&app_config.storage).await);
    let settings = &app_config.backup;

    let service = Arc::new(BackupService::new(
        settings.clone(),
        app_config.database.clone(),
        object_store,
        Arc::new(PgDumpInvoker::new(settings.tool_timeout)),
        Arc::new(PsqlRestoreInvoker::new(settings.tool_timeout, settings.restore_stop_on_error)),
        audit_store.clone(),
        audit_store.clone(),
        Arc::new(PgAdvisoryLock::new(pool.clone())),
    ));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        notify::notifier_from_config(&app_config.notifications),
        audit_store.clone(),
        app_config.notifications.context_label.clone(),
    ));

    let scheduler = Arc::new(BackupScheduler::new(
        service.clone(),
        audit_store.clone(),
        dispatcher.clone(),
        app_config.scheduler.tick_interval,
    ));
    let console = AdminConsole::new(service, audit_store.clone(), audit_store, dispatcher);

    Components {
        console,
        scheduler,
        pool,
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load application configuration from {}", cli.config.display()))?;
    info!(
        database = %app_config.database.database,
        host = %app_config.database.host,
        bucket = %app_config.storage.bucket_name,
        "Configuration loaded"
    );

    let components = build_components(&app_config).await;
    if let Err(e) = audit::schema::ensure_schema(&components.pool).await {
        warn!(error = %e, "Could not verify audit tables; history may be unavailable");
    }

    let caller = AdminCaller {
        user_id: cli.user_id,
        email: cli.email.clone(),
    };

    let result = run_command(cli.command, &caller, &components, &app_config).await;
    // Manual runs notify on spawned tasks; the runtime must outlive them.
    components
        .console
        .flush_notifications(NOTIFICATION_FLUSH_TIMEOUT)
        .await;
    result
}

async fn run_command(
    command: Commands,
    caller: &AdminCaller,
    components: &Components,
    app_config: &AppConfig,
) -> Result<()> {
    let console = &components.console;
    match command {
        Commands::Serve => serve(components, app_config).await?,
        Commands::Backup => {
            let artifact = console.create_backup(caller).await?;
            println!(
                "Created {} ({})",
                artifact.filename,
                utils::format_bytes(artifact.size_bytes)
            );
        }
        Commands::List { json } => {
            let artifacts = console.list_backups().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&artifacts)?);
            } else if artifacts.is_empty() {
                println!("No backups found.");
            } else {
                for artifact in &artifacts {
                    println!(
                        "{}  {:>12}  {}",
                        artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        utils::format_bytes(artifact.size_bytes),
                        artifact.filename
                    );
                }
            }
        }
        Commands::Restore { filename, confirm } => {
            console.restore_backup(caller, &filename, confirm).await?;
            println!("Restored {} into {}", filename, app_config.database.database);
        }
        Commands::Delete { filename } => {
            console.delete_backup(caller, &filename).await?;
            println!("Deleted {}", filename);
        }
        Commands::Download { filename, output } => {
            let reader = console.download_backup(&filename).await?;
            let destination = output.unwrap_or_else(|| PathBuf::from(&filename));
            let written = write_download(reader, &destination).await?;
            println!(
                "Downloaded {} to {} ({})",
                filename,
                destination.display(),
                utils::format_bytes(written)
            );
        }
        Commands::Schedule { action } => {
            let schedule = match action {
                ScheduleAction::Show => console.schedule().await?,
                ScheduleAction::Set {
                    enabled,
                    time,
                    retention_days,
                } => {
                    console
                        .update_schedule(&ScheduleChange {
                            enabled,
                            schedule_time: time,
                            retention_days,
                        })
                        .await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        Commands::History { limit } => {
            let entries = console.history(limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

/// Streams `reader` into `destination`, removing the file if the copy fails.
async fn write_download(mut reader: BlobReader, destination: &Path) -> Result<u64> {
    let copied = async {
        let mut file = tokio::fs::File::create(destination).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(written)
    }
    .await;

    match copied {
        Ok(written) => Ok(written),
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(destination).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %destination.display(), error = %cleanup, "Could not remove partial download");
                }
            }
            Err(e).with_context(|| format!("Failed to write {}", destination.display()))
        }
    }
}

async fn serve(components: &Components, app_config: &AppConfig) -> Result<()> {
    if !utils::setting::check_db_connection(&components.pool, &app_config.database).await {
        warn!("Starting the scheduler anyway; each tick retries the database");
    }

    match components.console.schedule().await {
        Ok(schedule) => info!(
            enabled = schedule.enabled,
            schedule_time = %schedule.schedule_time,
            retention_days = schedule.retention_days,
            "Loaded backup schedule"
        ),
        Err(e) => warn!(error = %e, "Could not load backup schedule; will retry on each tick"),
    }

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(components.scheduler.clone().run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();
    scheduler_task.await.context("Scheduler task panicked")?;
    Ok(())
}
