//! Soft deletion: flag a resource deleted, stop its pending work and queue
//! the single DELETE that tears it down at the provider.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{ProvisionError, Result};
use crate::operation::ABORT_RESOURCE_DELETED;
use crate::scheduler::Scheduler;
use crate::store::OperationStore;
use crate::types::{BatchId, OperationId, OperationKind, ResourceId};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteOutcome {
    pub resource_id: ResourceId,
    /// The resource was already deleted and its DELETE exists; nothing changed.
    pub already_deleted: bool,
    /// Group members flagged along with their group.
    pub children: Vec<ResourceId>,
    pub aborted: Vec<OperationId>,
    pub delete_operation: Option<OperationId>,
    /// `false` when an existing pending DELETE was reused.
    pub delete_created: bool,
    pub batch_id: Option<BatchId>,
}

pub struct SoftDeleteCoordinator {
    store: Arc<dyn OperationStore>,
    scheduler: Scheduler,
}

impl SoftDeleteCoordinator {
    pub fn new(store: Arc<dyn OperationStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    #[instrument(skip(self), fields(resource_id = %resource_id))]
    pub fn mark_deleted(&self, resource_id: ResourceId, actor: &str) -> Result<DeleteOutcome> {
        let (resource, newly) = self.store.mark_resource_deleted(resource_id, actor)?;
        let mut outcome = DeleteOutcome {
            resource_id,
            ..DeleteOutcome::default()
        };
        if !newly {
            let history = self.store.operations_for_resource(resource_id)?;
            if history.iter().any(|op| op.kind == OperationKind::Delete) {
                info!("resource already deleted");
                outcome.already_deleted = true;
                return Ok(outcome);
            }
            warn!("resource flagged deleted without a delete operation; resuming");
        }

        self.abort_pending(resource_id, false, &mut outcome)?;
        if resource.resource_type.is_group() {
            for member in self.store.resources_in_group(resource_id)? {
                if member.id == resource_id {
                    continue;
                }
                self.store.mark_resource_deleted(member.id, actor)?;
                outcome.children.push(member.id);
                // The group's DELETE removes its members too.
                self.abort_pending(member.id, true, &mut outcome)?;
            }
        }

        let description = format!("delete {} {}", resource.resource_type, resource.name);
        let (delete_op, created) = self
            .store
            .ensure_delete_operation(resource_id, &description)?;
        let batch = self.scheduler.enqueue_batch(&[delete_op.id], &description)?;
        info!(
            actor,
            op_id = %delete_op.id,
            created,
            aborted = outcome.aborted.len(),
            children = outcome.children.len(),
            "resource marked deleted"
        );

        outcome.delete_operation = Some(delete_op.id);
        outcome.delete_created = created;
        outcome.batch_id = Some(batch.id);
        Ok(outcome)
    }

    fn abort_pending(
        &self,
        resource_id: ResourceId,
        include_deletes: bool,
        outcome: &mut DeleteOutcome,
    ) -> Result<()> {
        for op in self.store.operations_for_resource(resource_id)? {
            if op.is_terminal() || (op.kind == OperationKind::Delete && !include_deletes) {
                continue;
            }
            match self.store.abort(op.id, ABORT_RESOURCE_DELETED) {
                Ok(_) => outcome.aborted.push(op.id),
                // Finished or aborted by someone else in the meantime.
                Err(ProvisionError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
