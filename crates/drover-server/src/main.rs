mod config;
mod error;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use drover_core::config::ControlConfig;
use drover_core::coordination::Coordination;
use drover_core::scheduler::runner::SchedulerRunner;
use drover_core::{recovery, scheduler};
use drover_db::pool;

use config::ServerConfig;
use state::AppState;

#[derive(Parser)]
#[command(name = "drover", about = "Control plane for a fleet of AI coding workers")]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a drover config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/drover")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the drover database and run migrations
    DbInit,
    /// Run the control-plane server (HTTP + background scheduler)
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one scheduling cycle and print the result
    Cycle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { bind, port } => cmd_serve(cli.database_url.as_deref(), &bind, port).await,
        Commands::Cycle => cmd_cycle(cli.database_url.as_deref()).await,
    }
}

/// `drover init`: write the config file with a fresh worker-key secret.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let key_secret = config::generate_key_secret();
    let file = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        auth: config::AuthSection {
            key_secret: key_secret.clone(),
        },
    };
    config::save_config(&file)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  auth.key_secret = {}...{}",
        &key_secret[..8],
        &key_secret[56..]
    );
    println!();
    println!("Next: run `drover db-init` to create and migrate the database.");

    Ok(())
}

/// `drover db-init`: ensure the database exists and apply migrations.
async fn cmd_db_init(database_url: Option<&str>) -> Result<()> {
    let server_config = ServerConfig::resolve(database_url)?;

    pool::ensure_database_exists(&server_config.db_config).await?;
    let db = pool::create_pool(&server_config.db_config).await?;
    pool::run_migrations(&db).await?;
    db.close().await;

    println!("Database ready at {}", server_config.db_config.database_url);
    Ok(())
}

/// `drover serve`: rebuild coordination mirrors, start the background
/// scheduler, and serve the API until interrupted.
async fn cmd_serve(database_url: Option<&str>, bind: &str, port: u16) -> Result<()> {
    let server_config = ServerConfig::resolve(database_url)?;
    let control_config = ControlConfig::from_env();

    let db = pool::create_pool(&server_config.db_config).await?;
    let coord = Coordination::in_memory();

    recovery::rebuild_mirrors(&db, &coord, &control_config)
        .await
        .context("failed to rebuild coordination mirrors")?;

    let runner = SchedulerRunner::spawn(db.clone(), coord.clone(), control_config.clone());

    let app_state = AppState::new(db, coord, control_config, server_config.key_config);
    let app = routes::build_router(app_state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serve listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runner.shutdown().await;
    tracing::info!("drover serve shut down");
    Ok(())
}

/// `drover cycle`: one scheduling cycle against a fresh mirror rebuild.
async fn cmd_cycle(database_url: Option<&str>) -> Result<()> {
    let server_config = ServerConfig::resolve(database_url)?;
    let control_config = ControlConfig::from_env();

    let db = pool::create_pool(&server_config.db_config).await?;
    let coord = Coordination::in_memory();
    recovery::rebuild_mirrors(&db, &coord, &control_config).await?;

    let result = scheduler::run_cycle(&db, &coord, &control_config).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
