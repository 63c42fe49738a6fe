use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::config::{ProvisionConfig, WarnLevel};
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::paths;
use crate::queue::{ProvisioningQueue, RedbQueue};
use crate::retry::RetryController;
use crate::scheduler::Scheduler;
use crate::soft_delete::SoftDeleteCoordinator;
use crate::store::{OperationStore, RedbStore};
use crate::worker::WorkerPool;

/// Store, queue and config of one provisioning root, wired together.
///
/// The databases are opened per transaction, so several worker processes and
/// operator commands can share a root.
pub struct Provisioner {
    root: PathBuf,
    config: ProvisionConfig,
    store: Arc<RedbStore>,
    queue: Arc<RedbQueue>,
}

impl Provisioner {
    /// Create `.provision/` with a default config unless one exists.
    /// Returns `true` when a new config was written.
    pub fn init(root: &Path) -> Result<bool> {
        let defaults = serde_yaml::to_string(&ProvisionConfig::default())?;
        crate::io::write_if_missing(&paths::config_path(root), defaults.as_bytes())
    }

    pub fn open(root: &Path) -> Result<Self> {
        let config = ProvisionConfig::load(root)?;
        for warning in config.validate() {
            match warning.level {
                WarnLevel::Error => warn!(detail = %warning.message, "config error"),
                WarnLevel::Warning => warn!(detail = %warning.message, "config warning"),
            }
        }
        let store = RedbStore::open(&paths::store_path(root), config.retry.default_max_tries)?;
        let queue = RedbQueue::open(&paths::queue_path(root), config.queue.visibility_timeout())?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn OperationStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn ProvisioningQueue> {
        self.queue.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.store(), self.queue())
    }

    pub fn retry_controller(&self) -> RetryController {
        RetryController::new(self.store(), self.scheduler(), &self.config)
    }

    pub fn soft_delete(&self) -> SoftDeleteCoordinator {
        SoftDeleteCoordinator::new(self.store(), self.scheduler())
    }

    pub fn dispatcher(&self, drivers: DriverRegistry) -> Dispatcher {
        Dispatcher::new(
            self.store(),
            self.queue(),
            Arc::new(drivers),
            DispatchSettings::from_config(&self.config),
        )
    }

    pub fn worker_pool(&self, drivers: DriverRegistry) -> WorkerPool {
        WorkerPool::new(self.store(), self.queue(), Arc::new(drivers), &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::types::ResourceType;
    use tempfile::TempDir;

    #[test]
    fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        assert!(Provisioner::init(dir.path()).unwrap());
        assert!(!Provisioner::init(dir.path()).unwrap());
        assert!(paths::config_path(dir.path()).exists());
    }

    #[test]
    fn open_uses_configured_budget() {
        let dir = TempDir::new().unwrap();
        let mut config = ProvisionConfig::default();
        config.retry.default_max_tries = 6;
        config.save(dir.path()).unwrap();

        let provisioner = Provisioner::open(dir.path()).unwrap();
        let scheduler = provisioner.scheduler();
        let sa = scheduler
            .create_resource(Resource::new(ResourceType::StorageAccount, "sa", "norwayeast"))
            .unwrap();
        let op = scheduler
            .schedule_operation(sa.id, crate::types::OperationKind::Create, serde_json::Value::Null, None, None)
            .unwrap();
        assert_eq!(op.max_try_count, 6);
        assert!(paths::store_path(dir.path()).exists());
    }

    #[test]
    fn two_provisioners_share_one_root() {
        let dir = TempDir::new().unwrap();
        Provisioner::init(dir.path()).unwrap();
        let worker_side = Provisioner::open(dir.path()).unwrap();
        let operator_side = Provisioner::open(dir.path()).unwrap();

        let rg = worker_side
            .scheduler()
            .create_resource(Resource::new(ResourceType::ResourceGroup, "rg", "norwayeast"))
            .unwrap();
        let outcome = operator_side.soft_delete().mark_deleted(rg.id, "operator").unwrap();
        assert!(outcome.delete_created);
        assert!(worker_side.store().get_resource(rg.id).unwrap().deleted);
        assert_eq!(worker_side.queue().stats().unwrap().visible, 1);
    }
}
