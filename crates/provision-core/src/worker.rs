//! Worker pool: several dispatchers sharing one store and queue, plus the
//! periodic stale-claim sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProvisionConfig;
use crate::dispatcher::{blocking, DispatchSettings, Dispatcher};
use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::operation::Operation;
use crate::queue::ProvisioningQueue;
use crate::store::OperationStore;

pub struct WorkerPool {
    store: Arc<dyn OperationStore>,
    queue: Arc<dyn ProvisioningQueue>,
    drivers: Arc<DriverRegistry>,
    settings: DispatchSettings,
    workers: usize,
    stale_claim_age: Duration,
    stale_check_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn OperationStore>,
        queue: Arc<dyn ProvisioningQueue>,
        drivers: Arc<DriverRegistry>,
        config: &ProvisionConfig,
    ) -> Self {
        Self {
            store,
            queue,
            drivers,
            settings: DispatchSettings::from_config(config),
            workers: config.dispatcher.workers.max(1),
            stale_claim_age: config.dispatcher.stale_claim_age(),
            stale_check_interval: config.dispatcher.stale_check_interval(),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.queue.clone(),
            self.drivers.clone(),
            self.settings.clone(),
        )
    }

    /// Run every dispatcher until `shutdown` fires, then wait for in-flight
    /// passes to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            workers = self.workers,
            stale_claim_secs = self.stale_claim_age.as_secs(),
            "worker pool starting"
        );

        let mut tasks = JoinSet::new();
        for _ in 0..self.workers {
            let dispatcher = self.dispatcher();
            let token = shutdown.clone();
            tasks.spawn(async move { dispatcher.run(token).await });
        }

        let mut sweep = interval(self.stale_check_interval.max(Duration::from_secs(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker pool shutdown requested");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.recover_stale().await {
                        error!(error = %e, "stale-claim sweep failed");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatcher task panicked");
            }
        }
        info!("worker pool stopped");
    }

    /// Fail operations whose claim has not been refreshed within the stale age.
    pub async fn recover_stale(&self) -> Result<Vec<Operation>> {
        let (store, max_age) = (Arc::clone(&self.store), self.stale_claim_age);
        let recovered = blocking(move || store.recover_stale(max_age)).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stale claims");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{Harness, ScriptedDriver};
    use crate::types::{OperationKind, OperationStatus, ResourceType};

    fn pool(h: &Harness, driver: Arc<ScriptedDriver>, workers: usize) -> WorkerPool {
        let mut config = ProvisionConfig::default();
        config.dispatcher.workers = workers;
        config.dispatcher.heartbeat_interval_ms = 20;
        config.queue.poll_interval_ms = 10;
        config.retry.default_delay_secs = 0;
        config.retry.delays.clear();
        WorkerPool::new(
            h.store.clone(),
            h.queue.clone(),
            Arc::new(DriverRegistry::new().with_fallback(driver)),
            &config,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_drains_independent_batches_then_stops() {
        let h = Harness::new(3);
        let mut ops = Vec::new();
        for i in 0..4 {
            let sa = h.resource(ResourceType::StorageAccount, &format!("sa-{i}"), None);
            let create = h.op(&sa, OperationKind::Create, None);
            h.scheduler.enqueue_batch(&[create.id], "sa").unwrap();
            ops.push(create.id);
        }

        let driver = Arc::new(ScriptedDriver::default());
        let pool = pool(&h, driver.clone(), 3);
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let store = h.store.clone();
        let watched = ops.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let done = watched.iter().all(|id| {
                    store.get_operation(*id).unwrap().status == OperationStatus::DoneSuccessful
                });
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), pool.run(shutdown))
            .await
            .expect("pool stops after shutdown");

        for id in ops {
            assert_eq!(h.status(id), OperationStatus::DoneSuccessful);
        }
        assert_eq!(driver.calls().len(), 4);
    }

    #[tokio::test]
    async fn recover_stale_releases_abandoned_claims() {
        let h = Harness::new(3);
        let vm = h.resource(ResourceType::VirtualMachine, "vm", None);
        let create = h.op(&vm, OperationKind::Create, None);
        h.store.set_in_progress(create.id, create.version, "crashed").unwrap();

        let mut config = ProvisionConfig::default();
        config.dispatcher.stale_claim_secs = 0;
        let pool = WorkerPool::new(
            h.store.clone(),
            h.queue.clone(),
            Arc::new(DriverRegistry::new()),
            &config,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = pool.recover_stale().await.unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(h.status(create.id), OperationStatus::Failed);
    }
}
