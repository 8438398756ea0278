use std::sync::Arc;

use streamvault::application::AuditService;
use streamvault::correlation::rules::{register_builtin_rules, RuleRegistry};
use streamvault::infrastructure::bus::InMemoryBus;
use streamvault::infrastructure::kms::LocalKms;
use streamvault::infrastructure::storage::InMemoryStorage;
use streamvault::pipeline::coordinator::PipelineCoordinator;
use streamvault::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        workers = config.normalizer.worker_pool_size,
        rate_limit_rps = config.admission.rate_limit_rps,
        "starting StreamVault pipeline"
    );

    let master_key = config.master_key_bytes()?;
    let kms = Arc::new(LocalKms::new(master_key)?);

    // The broker and storage backends are external collaborators; the
    // in-memory implementations stand in until real adapters are wired.
    let bus = Arc::new(InMemoryBus::new());
    let storage = Arc::new(InMemoryStorage::new());
    let audit = Arc::new(AuditService::new());

    let registry = Arc::new(RuleRegistry::new());
    register_builtin_rules(&registry).await?;

    let mut coordinator =
        PipelineCoordinator::new(config, bus, storage, kms, registry, audit);
    coordinator.start();
    tracing::info!("pipeline running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    coordinator.shutdown().await?;

    Ok(())
}
