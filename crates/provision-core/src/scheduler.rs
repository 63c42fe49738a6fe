//! Entry points callers use to record resources and operations and hand
//! batches to the queue.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{ProvisionError, Result};
use crate::operation::{NewOperation, Operation};
use crate::payload::OperationPayload;
use crate::queue::{Batch, ProvisioningQueue};
use crate::resource::Resource;
use crate::store::OperationStore;
use crate::types::{OperationId, OperationKind, ResourceId};

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn OperationStore>,
    queue: Arc<dyn ProvisioningQueue>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn OperationStore>, queue: Arc<dyn ProvisioningQueue>) -> Self {
        Self { store, queue }
    }

    pub fn create_resource(&self, resource: Resource) -> Result<Resource> {
        let resource = self.store.create_resource(resource)?;
        info!(
            resource_id = %resource.id,
            resource_type = %resource.resource_type,
            name = %resource.name,
            "created resource"
        );
        Ok(resource)
    }

    /// Validate a raw JSON payload for `kind` and record a `NotStarted` operation.
    pub fn schedule_operation(
        &self,
        resource_id: ResourceId,
        kind: OperationKind,
        raw_payload: serde_json::Value,
        depends_on: Option<OperationId>,
        description: Option<String>,
    ) -> Result<Operation> {
        let payload = OperationPayload::parse(kind, raw_payload)?;
        let mut new = NewOperation::new(resource_id, payload);
        new.depends_on = depends_on;
        if let Some(description) = description {
            new = new.describe(description);
        }
        self.schedule(new)
    }

    pub fn schedule(&self, new: NewOperation) -> Result<Operation> {
        new.payload.validate()?;
        let op = self.store.create_operation(new)?;
        info!(
            op_id = %op.id,
            resource_id = %op.resource_id,
            kind = %op.kind,
            depends_on = ?op.depends_on,
            "scheduled operation"
        );
        Ok(op)
    }

    /// Put operations on the queue as one batch, predecessors first.
    #[instrument(skip(self, ops), fields(ops = ops.len()))]
    pub fn enqueue_batch(&self, ops: &[OperationId], description: &str) -> Result<Batch> {
        if ops.is_empty() {
            return Err(ProvisionError::InvalidPayload(
                "a batch needs at least one operation".to_string(),
            ));
        }
        let mut loaded = Vec::with_capacity(ops.len());
        for id in ops {
            loaded.push(self.store.get_operation(*id)?);
        }
        let batch = Batch::new(linearize(&loaded), description);
        self.store.assign_batch(&batch.operations, batch.id)?;
        let message_id = self.queue.enqueue(&batch, None)?;
        info!(batch_id = %batch.id, %message_id, "enqueued batch");
        Ok(batch)
    }
}

/// Order operations so that any predecessor inside the set comes before its
/// dependents. Otherwise the given order is kept; duplicates are dropped.
///
/// Dependencies always point at operations that existed when the dependent
/// was created, so the graph has no cycles.
pub fn linearize(ops: &[Operation]) -> Vec<OperationId> {
    let mut remaining: Vec<&Operation> = Vec::with_capacity(ops.len());
    let mut seen = HashSet::new();
    for op in ops {
        if seen.insert(op.id) {
            remaining.push(op);
        }
    }

    let mut pending: HashSet<OperationId> = remaining.iter().map(|op| op.id).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|op| {
            let blocked = op.depends_on.is_some_and(|dep| pending.contains(&dep));
            if !blocked {
                pending.remove(&op.id);
                ordered.push(op.id);
            }
            blocked
        });
        if remaining.len() == before {
            // Unreachable for store-created operations; keep the rest as given.
            ordered.extend(remaining.iter().map(|op| op.id));
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RedbQueue;
    use crate::store::RedbStore;
    use crate::types::{OperationStatus, ResourceType};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<RedbStore>, Arc<RedbQueue>, Scheduler) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("store.redb"), 3).unwrap());
        let queue = Arc::new(
            RedbQueue::open(&dir.path().join("queue.redb"), Duration::from_secs(30)).unwrap(),
        );
        let scheduler = Scheduler::new(store.clone(), queue.clone());
        (dir, store, queue, scheduler)
    }

    #[test]
    fn schedule_operation_validates_payload() {
        let (_dir, _store, _queue, scheduler) = setup();
        let nsg = scheduler
            .create_resource(Resource::new(ResourceType::NetworkSecurityGroup, "nsg", "norwayeast"))
            .unwrap();
        let err = scheduler
            .schedule_operation(
                nsg.id,
                OperationKind::EnsureFirewallRules,
                json!({"rules": [{"name": "ssh", "priority": 5, "direction": "inbound", "source": "*"}]}),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPayload(_)));

        let op = scheduler
            .schedule_operation(nsg.id, OperationKind::Create, json!({"settings": {"sku": "basic"}}), None, None)
            .unwrap();
        assert_eq!(op.status, OperationStatus::NotStarted);
        assert_eq!(op.kind, OperationKind::Create);
    }

    #[test]
    fn create_and_update_record_desired_state() {
        let (_dir, store, _queue, scheduler) = setup();
        let sa = scheduler
            .create_resource(Resource::new(ResourceType::StorageAccount, "sa", "norwayeast"))
            .unwrap();
        scheduler
            .schedule_operation(sa.id, OperationKind::Create, json!({"settings": {"sku": "lrs"}}), None, None)
            .unwrap();
        scheduler
            .schedule_operation(sa.id, OperationKind::Delete, json!({}), None, None)
            .unwrap();
        assert_eq!(store.get_resource(sa.id).unwrap().desired_state, json!({"sku": "lrs"}));
    }

    #[test]
    fn enqueue_batch_puts_predecessors_first() {
        let (_dir, store, queue, scheduler) = setup();
        let vnet = scheduler
            .create_resource(Resource::new(ResourceType::VirtualNetwork, "vnet", "norwayeast"))
            .unwrap();
        let create = scheduler
            .schedule_operation(vnet.id, OperationKind::Create, json!({}), None, None)
            .unwrap();
        let update = scheduler
            .schedule_operation(vnet.id, OperationKind::Update, json!({}), Some(create.id), None)
            .unwrap();

        let batch = scheduler
            .enqueue_batch(&[update.id, create.id], "vnet setup")
            .unwrap();
        assert_eq!(batch.operations, vec![create.id, update.id]);
        assert_eq!(store.get_operation(update.id).unwrap().batch_id, Some(batch.id));

        let delivery = queue.dequeue().unwrap().unwrap();
        assert_eq!(delivery.batch, batch);
    }

    #[test]
    fn enqueue_batch_rejects_empty_and_unknown() {
        let (_dir, _store, _queue, scheduler) = setup();
        assert!(matches!(
            scheduler.enqueue_batch(&[], "empty").unwrap_err(),
            ProvisionError::InvalidPayload(_)
        ));
        assert!(matches!(
            scheduler.enqueue_batch(&[OperationId::new()], "ghost").unwrap_err(),
            ProvisionError::OperationNotFound(_)
        ));
    }

    #[test]
    fn linearize_keeps_independent_order_and_drops_duplicates() {
        let (_dir, _store, _queue, scheduler) = setup();
        let a = scheduler
            .create_resource(Resource::new(ResourceType::StorageAccount, "sa", "norwayeast"))
            .unwrap();
        let b = scheduler
            .create_resource(Resource::new(ResourceType::Bastion, "bastion", "norwayeast"))
            .unwrap();
        let op_a = scheduler
            .schedule_operation(a.id, OperationKind::Create, json!({}), None, None)
            .unwrap();
        let op_b = scheduler
            .schedule_operation(b.id, OperationKind::Create, json!({}), None, None)
            .unwrap();
        let ids = linearize(&[op_b.clone(), op_a.clone(), op_b.clone()]);
        assert_eq!(ids, vec![op_b.id, op_a.id]);
    }
}
