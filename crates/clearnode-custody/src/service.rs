//! Supervisor for the settlement tasks: one listener per chain plus the
//! action worker, sharing one shutdown signal.

use clearnode_chain::ChainRegistry;
use clearnode_core::SettlementConfig;
use clearnode_store::Store;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use crate::engine::CustodyEngine;
use crate::error::ServiceError;
use crate::listener::EventListener;
use crate::notify::Notifier;
use crate::reconciler::Reconciler;
use crate::worker::ActionWorker;

pub struct SettlementService {
    config: SettlementConfig,
    store: Store,
    chains: Arc<ChainRegistry>,
    engine: Arc<CustodyEngine>,
}

impl SettlementService {
    pub fn new(
        config: SettlementConfig,
        store: Store,
        chains: ChainRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ServiceError> {
        let chains = Arc::new(chains);
        let engine = Arc::new(CustodyEngine::new(
            &config,
            store.clone(),
            chains.clone(),
            notifier,
        )?);
        Ok(Self {
            config,
            store,
            chains,
            engine,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn engine(&self) -> &Arc<CustodyEngine> {
        &self.engine
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.engine.clone())
    }

    pub fn worker(&self) -> ActionWorker {
        ActionWorker::new(
            self.store.clone(),
            self.chains.clone(),
            self.config.worker.clone(),
        )
    }

    /// Run every task until `shutdown` turns true or one task stops.
    ///
    /// A listener that gives up stops the remaining tasks and its error is
    /// returned. In-flight transactions are never interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for entry in self.chains.entries() {
            let listener = EventListener::new(
                self.engine.clone(),
                entry,
                self.config.listener.clone(),
            );
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move { listener.run(stop_rx).await.map_err(ServiceError::from) });
        }
        let worker = self.worker();
        tasks.spawn(async move {
            worker.run(stop_rx).await;
            Ok(())
        });
        tracing::info!(chains = self.chains.len(), "settlement service started");

        let mut first_error = None;
        tokio::select! {
            _ = crate::stopped(&mut shutdown) => {
                tracing::info!("shutdown requested");
            }
            Some(joined) = tasks.join_next() => {
                tracing::warn!("settlement task exited, stopping service");
                collect(joined, &mut first_error);
            }
        }

        let _ = stop.send(true);
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &mut first_error);
        }
        tracing::info!("settlement service stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn collect(
    joined: Result<Result<(), ServiceError>, JoinError>,
    first_error: &mut Option<ServiceError>,
) {
    let result = joined.unwrap_or_else(|e| Err(ServiceError::Task(e.to_string())));
    if let Err(e) = result {
        tracing::error!(error = %e, "settlement task failed");
        first_error.get_or_insert(e);
    }
}
