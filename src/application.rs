//! Process wiring: store, background jobs, config reload and the HTTP API.

use crate::api::{self, ApiConfig};
use crate::core::{Config, ConfigWatcher, Result};
use crate::registry::{KpiRegistry, StaticKpiRegistry};
use crate::storage::ObservationStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main application struct that owns the store and its workers.
pub struct Application {
    store: Arc<ObservationStore>,
    registry: Arc<dyn KpiRegistry>,
    config: Config,
    config_path: Option<PathBuf>,
    shutdown: CancellationToken,
}

impl Application {
    /// Create a new Application with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ObservationStore::new(config.clone())?);
        Ok(Self {
            store,
            registry: Arc::new(StaticKpiRegistry::new(Vec::new())),
            config,
            config_path: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Use a KPI registry for display names
    pub fn with_registry(mut self, registry: Arc<dyn KpiRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Reload retention settings when this file changes
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Token that stops every worker and the API when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The store.
    pub fn store(&self) -> &Arc<ObservationStore> {
        &self.store
    }

    /// Run until Ctrl-C or the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting kpistore");

        let mut workers = self.spawn_jobs();
        if let Some(handle) = self.spawn_config_reload() {
            workers.push(handle);
        }

        let api_handle = tokio::spawn(api::start_server(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            ApiConfig::from(&self.config.server),
            self.shutdown.clone(),
        ));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping...");
            }
            _ = self.shutdown.cancelled() => {}
        }
        self.shutdown.cancel();

        match api_handle.await {
            Ok(Err(e)) => tracing::error!("API server error: {}", e),
            Err(e) => tracing::error!("API task failed: {}", e),
            Ok(Ok(())) => {},
        }
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }

        // Flush whatever the write path queued before exit
        let report = self.store.drain_aggregator();
        tracing::info!("Final aggregator drain applied {} events", report.events);
        Ok(())
    }

    fn spawn_jobs(&self) -> Vec<JoinHandle<()>> {
        let jobs = &self.config.jobs;
        vec![
            spawn_periodic(
                "aggregator",
                jobs.aggregation_interval,
                Arc::clone(&self.store),
                self.shutdown.clone(),
                |store, _| {
                    let report = store.drain_aggregator();
                    if report.events > 0 {
                        tracing::debug!(
                            "Aggregator drained {} events ({} folds, {} recomputed, {} failed)",
                            report.events,
                            report.folds_applied,
                            report.recomputed,
                            report.failed
                        );
                    }
                },
            ),
            spawn_periodic(
                "rollover",
                jobs.rollover_interval,
                Arc::clone(&self.store),
                self.shutdown.clone(),
                |store, cancel| {
                    let report = store.run_rollover(cancel);
                    if report.sealed + report.compressed + report.failed > 0 {
                        tracing::info!(
                            "Rollover sealed {} and compressed {} partitions ({} failed)",
                            report.sealed,
                            report.compressed,
                            report.failed
                        );
                    }
                },
            ),
            spawn_periodic(
                "retention",
                jobs.retention_interval,
                Arc::clone(&self.store),
                self.shutdown.clone(),
                |store, cancel| {
                    let report = store.run_retention(cancel);
                    if report.demoted + report.archived + report.purged + report.failed > 0 {
                        tracing::info!(
                            "Retention demoted {}, archived {}, purged {} partitions ({} failed)",
                            report.demoted,
                            report.archived,
                            report.purged,
                            report.failed
                        );
                    }
                },
            ),
        ]
    }

    fn spawn_config_reload(&self) -> Option<JoinHandle<()>> {
        let path = self.config_path.clone()?;
        let watcher = ConfigWatcher::new(path, self.config.clone());
        let mut updates = watcher.subscribe();
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                tracing::error!("Config watcher stopped: {}", e);
            }
        });

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let policy = updates.borrow_and_update().retention.clone();
                        if let Err(e) = store.update_policy(policy) {
                            tracing::error!("Rejected reloaded retention policy: {}", e);
                        }
                    }
                }
            }
        }))
    }
}

/// Run `job` on the blocking pool every `period` until `shutdown` fires.
fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    store: Arc<ObservationStore>,
    shutdown: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn(&ObservationStore, &CancellationToken) + Send + Sync + Clone + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!("{} job running every {:?}", name, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let store = Arc::clone(&store);
            let cancel = shutdown.clone();
            let job = job.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || job(store.as_ref(), &cancel)).await {
                tracing::error!("{} job panicked: {}", name, e);
            }
        }
        tracing::debug!("{} job stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConfigBuilder;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_periodic_job_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .data_dir(dir.path().to_path_buf())
            .build()
            .unwrap();
        let store = Arc::new(ObservationStore::new(config).unwrap());
        let shutdown = CancellationToken::new();
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = spawn_periodic(
            "test",
            Duration::from_millis(10),
            store,
            shutdown.clone(),
            move |_, _| {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(runs.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }
}
