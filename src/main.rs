//! `campaignctl` CLI: a thin `clap` front end over the library crate,
//! wrapping the same services the HTTP server uses (design SPEC_FULL
//! "Ambient: CLI").
//!
//! Exit codes follow spec.md §6: `0` success, `2` usage error,
//! `3` storage unavailable, `4` configuration invalid.

use std::process::ExitCode;

use campaignctl::config::AppConfig;
use campaignctl::gateway::PersistenceGateway;
use campaignctl::{build_app_state, connect_postgres, spawn_scheduler};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "campaignctl", version, about = "Email campaign send pipeline control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the one-minute scheduler tick.
    Serve,
    /// Drive one campaign's dispatch loop standalone, without the HTTP
    /// server (design SPEC_FULL "Ambient: CLI").
    Send {
        #[arg(long)]
        org: Uuid,
        #[arg(long)]
        campaign: Uuid,
    },
    /// Print the current throttle snapshot for an org's global key.
    ThrottleStats {
        #[arg(long)]
        org: Uuid,
    },
    /// Confirm storage connectivity; a no-op beyond that, since the
    /// relational schema itself is external (spec.md Non-goals).
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return ExitCode::from(4);
        }
    };

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "storage unavailable");
            ExitCode::from(3)
        }
    }
}

async fn run(command: Command, config: AppConfig) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve => {
            let gateway = connect_postgres(&config).await?;
            let state = build_app_state(config, gateway);
            spawn_scheduler(&state);
            let addr: std::net::SocketAddr = state.config.bind_addr.parse()?;
            tracing::info!(%addr, "campaignctl listening");
            axum::Server::bind(&addr)
                .serve(campaignctl::http::router(state).into_make_service())
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Send { org, campaign } => {
            let gateway = connect_postgres(&config).await?;
            let state = build_app_state(config, gateway.clone());
            let campaign = gateway.get_campaign(org, campaign).await?;
            let finished = state.dispatcher.send_campaign(campaign).await?;
            tracing::info!(status = ?finished.status, sent = finished.sent, "campaign dispatch finished");
            Ok(ExitCode::SUCCESS)
        }
        Command::ThrottleStats { org } => {
            let gateway = connect_postgres(&config).await?;
            let state = build_app_state(config, gateway);
            let snapshot = state.throttle.snapshot(org, campaignctl::models::ThrottleScope::Global);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => {
            connect_postgres(&config).await?;
            tracing::info!("storage reachable, no migration to run (schema is external)");
            Ok(ExitCode::SUCCESS)
        }
    }
}
