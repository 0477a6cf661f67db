//! `campaignctl` — control plane for the send pipeline of a high-volume
//! transactional/marketing email platform: throttled dispatch,
//! suppression, signed tracking, and A/B testing.
//!
//! The HTTP binary and the CLI (`src/main.rs`) are thin front ends over
//! this library; everything that matters lives in [`services`].

pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod http;
pub mod models;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::delivery::mailgun::{MailgunConfig, MailgunTransport};
use crate::delivery::pmta::{PmtaConfig, PmtaTransport};
use crate::delivery::ses::{SesConfig, SesTransport};
use crate::delivery::sendgrid::{SendgridConfig, SendgridTransport};
use crate::delivery::smtp::{SmtpConfig, SmtpTransport};
use crate::delivery::sparkpost::{SparkPostConfig, SparkPostTransport};
use crate::delivery::TransportRegistry;
use crate::gateway::postgres::PostgresGateway;
use crate::gateway::PersistenceGateway;
use crate::http::AppState;
use crate::models::ThrottleLimits;
use crate::services::{
    AbController, Dispatcher, EventBus, RecipientResolver, Scheduler, SuppressionIndex,
    ThrottleCore, TrackingIngest, UrlSigner,
};

/// Conservative defaults used until an org's keys are overridden via
/// the throttle HTTP surface or `AutoAdjust` (design §4.3).
pub fn default_throttle_limits() -> ThrottleLimits {
    ThrottleLimits {
        hourly: 10_000,
        daily: 100_000,
        burst: 500,
    }
}

/// Registers every feature-enabled delivery adapter under its vendor
/// name (design §4.5, §9 "duck-typed transports -> capability
/// abstraction"). Credentials are read from the environment directly by
/// each adapter's config rather than threaded through `AppConfig`,
/// mirroring how the donor keeps payment-gateway credentials scoped to
/// their own config structs.
pub fn build_transport_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();

    #[cfg(feature = "sparkpost")]
    registry.register(Arc::new(SparkPostTransport::new(SparkPostConfig {
        api_key: std::env::var("SPARKPOST_API_KEY").unwrap_or_default(),
        ..Default::default()
    })));

    #[cfg(feature = "ses")]
    registry.register(Arc::new(SesTransport::new(SesConfig {
        access_key: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
        secret_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
        region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        ..Default::default()
    })));

    #[cfg(feature = "mailgun")]
    registry.register(Arc::new(MailgunTransport::new(MailgunConfig {
        api_key: std::env::var("MAILGUN_API_KEY").unwrap_or_default(),
        domain: std::env::var("MAILGUN_DOMAIN").unwrap_or_default(),
        ..Default::default()
    })));

    #[cfg(feature = "sendgrid")]
    registry.register(Arc::new(SendgridTransport::new(SendgridConfig {
        api_key: std::env::var("SENDGRID_API_KEY").unwrap_or_default(),
        ..Default::default()
    })));

    #[cfg(feature = "smtp")]
    registry.register(Arc::new(SmtpTransport::new(SmtpConfig {
        host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(25),
        helo_domain: std::env::var("SMTP_HELO_DOMAIN").unwrap_or_else(|_| "localhost".to_string()),
    })));

    #[cfg(feature = "pmta")]
    registry.register(Arc::new(PmtaTransport::new(PmtaConfig {
        base_url: std::env::var("PMTA_BASE_URL").unwrap_or_default(),
        api_key: std::env::var("PMTA_API_KEY").unwrap_or_default(),
    })));

    registry
}

/// Wires up every service in the send pipeline against one gateway
/// implementation. Shared by the HTTP server, the `send` CLI command,
/// and integration tests that want the real wiring without a live
/// database (swap in [`gateway::memory::InMemoryGateway`]).
pub fn build_app_state(config: AppConfig, gateway: Arc<dyn PersistenceGateway>) -> AppState {
    let config = Arc::new(config);
    let signer = Arc::new(UrlSigner::from_config(&config));
    let events = Arc::new(EventBus::new());
    let suppression = Arc::new(SuppressionIndex::new(gateway.clone()));
    let throttle = Arc::new(ThrottleCore::new(default_throttle_limits()));
    let resolver = Arc::new(RecipientResolver::new(gateway.clone()));
    let transports = Arc::new(build_transport_registry());
    let ab_controller = Arc::new(AbController::new(gateway.clone()));
    let tracking = Arc::new(TrackingIngest::new(
        gateway.clone(),
        signer.clone(),
        events.clone(),
        &config,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        gateway.clone(),
        suppression.clone(),
        throttle.clone(),
        resolver.clone(),
        transports.clone(),
        events.clone(),
        signer.clone(),
        config.tracking_url.clone(),
    ));

    AppState {
        config,
        gateway,
        suppression,
        throttle,
        resolver,
        transports,
        dispatcher,
        ab_controller,
        tracking,
        events,
        signer,
    }
}

/// Spawns the scheduler's one-minute tick loop (design §4.10) as a
/// named background task. A second task refreshes the org list the
/// scheduler ticks over every minute and hands it across a watch
/// channel, so `Scheduler::run`'s synchronous org callback never blocks
/// the runtime on a gateway call.
pub fn spawn_scheduler(state: &AppState) -> tokio::task::JoinHandle<()> {
    let scheduler = Arc::new(Scheduler::new(
        state.gateway.clone(),
        state.ab_controller.clone(),
        state.dispatcher.clone(),
        state.throttle.clone(),
    ));
    let gateway = state.gateway.clone();
    let (tx, rx) = tokio::sync::watch::channel(Vec::<uuid::Uuid>::new());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            crate::services::scheduler::TICK_INTERVAL_SECS,
        ));
        loop {
            interval.tick().await;
            if let Ok(orgs) = gateway.list_orgs().await {
                let _ = tx.send(orgs);
            }
        }
    });

    tokio::spawn(async move {
        scheduler.run(move || rx.borrow().clone()).await;
    })
}

/// Connects to Postgres, mapping connection failure to CLI exit code
/// `3` (design §6 "storage unavailable").
pub async fn connect_postgres(config: &AppConfig) -> anyhow::Result<Arc<dyn PersistenceGateway>> {
    let gateway = PostgresGateway::connect(&config.database_url).await?;
    Ok(Arc::new(gateway))
}
