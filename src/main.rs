//! ambient-db - Main entry point.
//!
//! Connects to the configured database and runs one maintenance command:
//! apply migrations, roll back the latest one, report the schema version, or
//! ping the server.

use ambient_db::config::{Command, Config};
use ambient_db::context::Context;
use ambient_db::db::Database;
use ambient_db::error::DbResult;
use ambient_db::migrate::{MigrationCommand, Migrator};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> DbResult<()> {
    let settings = config.connection_settings()?;
    let db = Database::connect(settings).await?;
    let result = run_command(&db, config.command).await;
    db.close().await;
    result
}

async fn run_command(db: &Database, command: Command) -> DbResult<()> {
    let ctx = Context::background();
    let migrator = Migrator::new(&db.settings().migrations_dir);

    match command {
        Command::Migrate => {
            db.migrate(&ctx).await?;
        }
        Command::Rollback => {
            migrator.rollback(db, &ctx).await?;
        }
        Command::Version => {
            let (version, _) = migrator.run(db, &ctx, MigrationCommand::Version).await?;
            println!("{version}");
        }
        Command::Ping => {
            db.ping().await?;
            info!("Database is reachable");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        command = %config.command,
        "Starting ambient-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&config).await {
        error!(command = %config.command, error = %e, "Command failed");
        return Err(e.into());
    }

    Ok(())
}
