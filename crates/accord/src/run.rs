//! `accord run`: a long-lived replica.

use std::path::Path;
use std::sync::Arc;

use accord_engine::{DatasourceConfig, Engine, PolicyLibrary, Poller, TranslatorDriver};
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::AccordConfig;

pub async fn run(path: &Path, replica_id: Option<String>) -> Result<()> {
    let mut config = AccordConfig::load(path).await?;
    if let Some(id) = replica_id {
        config.engine.replica_id = id;
    }
    info!(replica = %config.engine.replica_id, config = %path.display(), "starting replica");

    let engine = Engine::new(config.engine.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let changes = tokio::spawn(log_changes(engine.subscribe_changes(), shutdown_rx));

    start(&engine, &config).await?;

    let mut poller = Poller::new(Arc::clone(&engine));
    poller.spawn_all();

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("received shutdown signal");

    poller.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = changes.await {
        warn!(error = %e, "change logger panicked");
    }
    info!("replica stopped");
    Ok(())
}

/// Create the configured datasources and policies, then activate library
/// policies.
async fn start(engine: &Engine, config: &AccordConfig) -> Result<()> {
    for spec in &config.datasources {
        let driver = TranslatorDriver::new(spec.driver.clone())
            .into_diagnostic()
            .wrap_err_with(|| format!("invalid datasource {}", spec.name))?;
        let mut ds = DatasourceConfig::new(&spec.name);
        ds.description = spec.description.clone();
        engine
            .create_datasource(ds, Arc::new(driver))
            .await
            .into_diagnostic()?;
    }

    for spec in &config.policies {
        engine
            .create_policy(spec.clone())
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to create policy {}", spec.name))?;
    }

    let library = PolicyLibrary::new();
    if let Some(dir) = &config.library_dir {
        library.load_dir(dir).await.into_diagnostic()?;
    }
    for name in &config.activate {
        library
            .activate(engine, name)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to activate library policy {}", name))?;
    }

    info!(
        datasources = config.datasources.len(),
        policies = engine.list_policies().await.len(),
        "replica ready"
    );
    Ok(())
}

async fn log_changes(
    mut changes: broadcast::Receiver<accord_datalog::TableChange>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            change = changes.recv() => match change {
                Ok(change) => info!(
                    table = %change.table,
                    inserted = change.inserted.len(),
                    deleted = change.deleted.len(),
                    "table changed"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "change log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
