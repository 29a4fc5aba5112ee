use config::Config;
use service::Service;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use transport::Transport;

pub mod claim;
pub mod config;
pub mod error;
pub mod mailer;
pub mod message;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;
pub mod worker;

/// Installs the global tracing subscriber, filtered by `COURIER_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("COURIER_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

/// Returns a builder for the delivery process. It runs the scheduler loop
/// against the configured store until ctrl-c, then drains the current cycle.
#[bon::builder(finish_fn = start)]
pub async fn run<T: Transport>(transport: T, config: Option<Config>) -> eyre::Result<()> {
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Service::connect_with(config).await?;

    if transport.is_dry_run() {
        warn!("dry-run transport configured, messages will be marked sent without delivery");
    }

    let handle = service.scheduler(transport).start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing current cycle");

    let stats = handle.stop().await?;
    info!(
        cycles = stats.cycles,
        sent = stats.sent,
        failed = stats.failed,
        exhausted = stats.exhausted,
        "delivery stopped"
    );

    Ok(())
}
