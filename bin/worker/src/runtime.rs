//! Assembles the engine from configuration and runs it until ctrl-c.

use crate::config::{ProviderEndpoint, WorkerConfig};
use crate::error::StartupError;
use classync_integration::{CredentialVault, HttpProvider, ProviderInfo, ProviderRegistry};
use classync_scheduler::{
    EntityLocks, JobHandler, JobScheduler, NatsBroker, NatsConfig, RecurringTicker, SyncLock,
};
use classync_store::PgTimetableStore;
use classync_sync::{SyncExecutor, SyncJobHandler, TimetableService};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Builds the provider registry from configured endpoints.
///
/// # Errors
///
/// Returns [`StartupError::Providers`] for an invalid URL or a duplicate id.
pub fn build_registry(endpoints: &[ProviderEndpoint]) -> Result<ProviderRegistry, StartupError> {
    let providers_error = |e: classync_integration::RegistryError| StartupError::Providers {
        details: e.to_string(),
    };

    let mut builder = ProviderRegistry::builder();
    for endpoint in endpoints {
        let info = ProviderInfo::new(endpoint.id.clone(), endpoint.name.clone());
        let provider = HttpProvider::new(info, &endpoint.base_url).map_err(providers_error)?;
        builder = builder.register(Arc::new(provider));
    }
    builder.build().map_err(providers_error)
}

/// Connects to NATS, or returns `None` when background sync must stay off.
async fn connect_broker(nats_url: Option<&str>) -> Option<Arc<NatsBroker>> {
    let Some(url) = nats_url else {
        warn!("no NATS URL configured, background sync disabled");
        return None;
    };
    match NatsBroker::connect(NatsConfig::new(url)).await {
        Ok(broker) => Some(Arc::new(broker)),
        Err(report) => {
            warn!(error = %report, "NATS unreachable, background sync disabled");
            None
        }
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Runs the worker.
///
/// # Errors
///
/// Returns a [`StartupError`] if a required dependency cannot be set up.
/// Broker unavailability is not an error.
pub async fn run(config: WorkerConfig) -> Result<(), StartupError> {
    let vault =
        CredentialVault::from_key(config.vault.key.as_bytes()).map_err(|report| {
            StartupError::Vault {
                details: report.to_string(),
            }
        })?;
    let registry = build_registry(&config.providers)?;
    if registry.is_empty() {
        warn!("no providers configured, every sync will fail");
    }
    info!(providers = registry.len(), "provider registry built");

    let database = |report: rootcause::prelude::Report<classync_store::StoreError>| {
        StartupError::Database {
            details: report.to_string(),
        }
    };
    let store =
        PgTimetableStore::connect(&config.database_url, config.database_max_connections)
            .await
            .map_err(database)?;
    info!("Running database migrations...");
    store.migrate().await.map_err(database)?;
    let store = Arc::new(store);

    let settings = &config.worker;
    let broker = connect_broker(config.nats_url.as_deref()).await;
    let scheduler = match &broker {
        Some(broker) => JobScheduler::active(broker.clone()),
        None => JobScheduler::Disabled,
    };

    let service = TimetableService::new(
        store.clone(),
        vault.clone(),
        registry.clone(),
        scheduler.clone(),
    );
    match service.resubscribe_all().await {
        Ok(applied) => info!(applied, "recurring syncs registered"),
        Err(e) => warn!(error = %e, "failed to resubscribe recurring syncs"),
    }

    let Some(broker) = broker else {
        info!("waiting for ctrl-c");
        wait_for_ctrl_c().await;
        return Ok(());
    };

    let lock: Arc<dyn SyncLock> = match broker
        .sync_lock(settings.lock_ttl(), settings.lock_wait())
        .await
    {
        Ok(lock) => Arc::new(lock),
        Err(report) => {
            warn!(error = %report, "shared sync lock unavailable, locking in process only");
            Arc::new(EntityLocks::new(settings.lock_wait()))
        }
    };
    let executor = SyncExecutor::new(store, vault, registry, scheduler, lock)
        .with_fetch_timeout(settings.fetch_timeout());
    let handler: Arc<dyn JobHandler> = Arc::new(SyncJobHandler::new(executor));

    let consumer = broker
        .consumer(settings.consumer_settings())
        .await
        .map_err(|report| StartupError::Broker {
            details: report.to_string(),
        })?;
    let ticker = RecurringTicker::new(broker.clone(), settings.tick_interval());

    let (stop_tx, stop_rx) = watch::channel(false);
    let ticker_task = tokio::spawn({
        let stop_rx = stop_rx.clone();
        async move { ticker.run(stopped(stop_rx)).await }
    });
    let consumer_task =
        tokio::spawn(async move { consumer.run(handler, stopped(stop_rx)).await });

    wait_for_ctrl_c().await;
    info!("shutting down");
    let _ = stop_tx.send(true);

    if let Err(e) = ticker_task.await {
        error!(error = %e, "ticker task failed");
    }
    match consumer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "consumer stopped with an error"),
        Err(e) => error!(error = %e, "consumer task failed"),
    }
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}
