//! Tally CLI, product API and chat gateway entry point.
//!
//! Binary name: `tally`
//!
//! Loads configuration, installs tracing, then either runs one of the two
//! HTTP services or executes a ledger administration command.

mod cli;
mod http;
mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tally_core::ledger::locks::RowLocks;
use tally_infra::config::{Secrets, apply_env_overrides, default_data_dir, load_config, process_env};
use tally_infra::sqlite::ledger::SqliteCreditLedger;
use tally_infra::sqlite::pool::{DatabasePool, database_url_for};
use tally_observe::{TracingOptions, init_tracing, shutdown_tracing};
use tally_types::config::TallyConfig;

use cli::{Cli, Commands};
use state::{AppState, GatewayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut config = load_config(cli.config.as_deref(), &data_dir).await;
    apply_env_overrides(&mut config, process_env);

    init_tracing(&TracingOptions {
        default_level: cli.log_level(&config.log.level).to_string(),
        json: config.log.json,
        otel: config.log.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli, config, &data_dir).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli, config: TallyConfig, data_dir: &Path) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { bind } => {
            let db_pool = open_database(&config, data_dir).await?;
            run_product(db_pool, &config, bind.as_deref()).await
        }
        Commands::Gateway { bind } => run_gateway(&config, bind.as_deref()).await,
        Commands::Credits { action } => {
            let ledger = admin_ledger(&config, data_dir).await?;
            cli::ledger::handle_credits_command(action, &ledger, cli.json).await
        }
        Commands::Limit { action } => {
            let ledger = admin_ledger(&config, data_dir).await?;
            cli::ledger::handle_limit_command(action, &ledger, cli.json).await
        }
        Commands::Detach { company, user } => {
            let ledger = admin_ledger(&config, data_dir).await?;
            cli::ledger::detach_user(&ledger, &company, &user, cli.json).await
        }
        Commands::Summary { company } => {
            let ledger = admin_ledger(&config, data_dir).await?;
            cli::ledger::company_summary(&ledger, &company, cli.json).await
        }
    }
}

async fn open_database(config: &TallyConfig, data_dir: &Path) -> anyhow::Result<DatabasePool> {
    let url = match &config.server.database_url {
        Some(url) => url.clone(),
        None => {
            tokio::fs::create_dir_all(data_dir)
                .await
                .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
            database_url_for(data_dir)
        }
    };
    DatabasePool::new(&url)
        .await
        .with_context(|| format!("failed to open database {url}"))
}

/// A ledger for one-shot admin commands. No server shares this process, so
/// it gets its own lock table.
async fn admin_ledger(config: &TallyConfig, data_dir: &Path) -> anyhow::Result<SqliteCreditLedger> {
    let db_pool = open_database(config, data_dir).await?;
    Ok(SqliteCreditLedger::new(db_pool, Arc::new(RowLocks::new())))
}

async fn run_product(db_pool: DatabasePool, config: &TallyConfig, bind: Option<&str>) -> anyhow::Result<()> {
    let secret = Secrets::from_env().require_shared_secret()?;
    let state = AppState::init(db_pool, config, secret)?;

    let addr = bind.unwrap_or(&config.server.product_bind);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "  {} Tally API listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!("  {}", console::style(format!("Gateway: {}", config.chat.gateway_url)).dim());
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_product_router(state);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\n  Server stopped.");
    Ok(())
}

async fn run_gateway(config: &TallyConfig, bind: Option<&str>) -> anyhow::Result<()> {
    let secrets = Secrets::from_env();
    let secret = secrets.require_shared_secret()?;
    let state = GatewayState::init(config, secret, secrets.provider_api_key.clone())?;

    let addr = bind.unwrap_or(&config.server.gateway_bind);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "  {} Tally gateway listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!(
        "  {}",
        console::style(format!("Provider: {} ({})", config.provider.base_url, config.provider.model)).dim()
    );

    let router = http::router::build_gateway_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\n  Gateway stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
