//! Periodic datasource polling, one task per datasource.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Owns the polling tasks of one engine and their shutdown signal.
pub struct Poller {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Poller {
    pub fn new(engine: Arc<Engine>) -> Self {
        let interval = engine.config().poll_interval();
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: Arc<Engine>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            interval,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Start polling one datasource. The task polls immediately, then every
    /// interval, and exits once the datasource is deleted or on shutdown.
    pub fn spawn(&mut self, datasource: impl Into<String>) {
        let engine = Arc::clone(&self.engine);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.interval;
        let datasource = datasource.into();
        self.tasks.push(tokio::spawn(async move {
            run(engine, datasource, interval, shutdown_rx).await;
        }));
    }

    /// Start polling every registered datasource.
    pub fn spawn_all(&mut self) {
        for info in self.engine.list_datasources() {
            self.spawn(info.name);
        }
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "poller task panicked");
            }
        }
    }
}

async fn run(
    engine: Arc<Engine>,
    datasource: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(datasource = %datasource, ?interval, "poller starting");

    loop {
        if *shutdown_rx.borrow() {
            info!(datasource = %datasource, "poller shutting down");
            break;
        }
        if !engine.has_datasource(&datasource) {
            info!(datasource = %datasource, "datasource removed, poller stopping");
            break;
        }

        match engine.poll_datasource(&datasource).await {
            Ok(changed) => debug!(datasource = %datasource, changed, "poll complete"),
            // Already recorded in the datasource status.
            Err(e) => debug!(datasource = %datasource, error = %e, "poll failed"),
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(datasource = %datasource, "poller received shutdown signal");
                }
            }
            _ = sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DatasourceConfig;
    use crate::driver::{DocumentSource, Mapping, TranslatorDriver, TranslatorDriverConfig};
    use crate::translator::{FieldTranslator, HdictTranslator, Translator};
    use crate::EngineConfig;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_shutdown() {
        let engine = Engine::new(EngineConfig::default());
        let driver = Arc::new(
            TranslatorDriver::new(TranslatorDriverConfig {
                source: DocumentSource::Inline {
                    document: json!([{"name": "h1"}]),
                },
                poll: vec![Mapping::new(Translator::Hdict(HdictTranslator {
                    table: "hosts".to_string(),
                    parent_key: None,
                    id_column: None,
                    in_list: true,
                    fields: vec![FieldTranslator::new("name")],
                }))],
                ..Default::default()
            })
            .unwrap(),
        );
        engine
            .create_datasource(DatasourceConfig::new("inventory"), driver.clone())
            .await
            .unwrap();

        let mut poller = Poller::with_interval(Arc::clone(&engine), Duration::from_secs(10));
        poller.spawn_all();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.list_rows("inventory", "hosts").await.unwrap().len(), 1);

        driver.set_document(json!([{"name": "h1"}, {"name": "h2"}])).await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.list_rows("inventory", "hosts").await.unwrap().len(), 2);
        assert!(engine.datasource_status("inventory").unwrap().number_of_updates >= 2);

        poller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_when_datasource_deleted() {
        let engine = Engine::new(EngineConfig::default());
        let driver = Arc::new(TranslatorDriver::new(TranslatorDriverConfig::default()).unwrap());
        engine
            .create_datasource(DatasourceConfig::new("empty"), driver)
            .await
            .unwrap();

        let mut poller = Poller::with_interval(Arc::clone(&engine), Duration::from_secs(5));
        poller.spawn("empty");
        engine.delete_datasource("empty").await.unwrap();
        sleep(Duration::from_secs(6)).await;

        assert!(poller.tasks.iter().all(|t| t.is_finished()));
        poller.shutdown().await;
    }
}
