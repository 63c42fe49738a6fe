//! Operator-driven recovery: retry a resource's failed work, or reschedule a
//! whole resource group whose creation stalled.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::operation::Operation;
use crate::scheduler::Scheduler;
use crate::store::OperationStore;
use crate::types::{BatchId, OperationId, OperationKind, OperationStatus, ResourceId, ResourceType};

#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub operation: Operation,
    pub batch_id: BatchId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RescheduleOutcome {
    pub group_id: ResourceId,
    pub batch_id: BatchId,
    /// Re-opened CREATE operations, in the order they will run.
    pub operations: Vec<OperationId>,
}

pub struct RetryController {
    store: Arc<dyn OperationStore>,
    scheduler: Scheduler,
    retry_increment: u32,
    mandatory_types: Vec<ResourceType>,
}

impl RetryController {
    pub fn new(store: Arc<dyn OperationStore>, scheduler: Scheduler, config: &ProvisionConfig) -> Self {
        Self {
            store,
            scheduler,
            retry_increment: config.retry.retry_increment,
            mandatory_types: config.groups.mandatory_types.clone(),
        }
    }

    /// Re-open the operation that has to be redone first for `resource_id`
    /// and put it back on the queue with a larger budget.
    #[instrument(skip(self), fields(resource_id = %resource_id))]
    pub fn retry_operation(&self, resource_id: ResourceId) -> Result<RetryOutcome> {
        let resource = self.store.get_resource(resource_id)?;
        let history = self.store.operations_for_resource(resource_id)?;
        let candidate =
            find_retry_candidate(&history).ok_or(ProvisionError::NothingToRetry(resource_id))?;
        if resource.deleted && candidate.kind != OperationKind::Delete {
            return Err(ProvisionError::ResourceDeleted(resource_id));
        }

        let reopened = self.store.reopen(candidate.id, self.retry_increment)?;
        let description = format!("retry {} {}", reopened.kind, resource.name);
        let batch = self.scheduler.enqueue_batch(&[reopened.id], &description)?;
        info!(
            op_id = %reopened.id,
            kind = %reopened.kind,
            max_tries = reopened.max_try_count,
            batch_id = %batch.id,
            "operation re-opened for retry"
        );
        Ok(RetryOutcome {
            operation: self.store.get_operation(reopened.id)?,
            batch_id: batch.id,
        })
    }

    /// Re-open every stalled CREATE in a resource group as one batch.
    ///
    /// Nothing is changed unless the whole group passes validation: every
    /// mandatory type must be present and no member's CREATE may be abandoned.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub fn reschedule_resource_group(&self, group_id: ResourceId) -> Result<RescheduleOutcome> {
        let members = self.store.resources_in_group(group_id)?;
        let group = members
            .iter()
            .find(|r| r.id == group_id)
            .ok_or(ProvisionError::InvalidResource(group_id))?;
        if !group.resource_type.is_group() {
            return Err(ProvisionError::InvalidPayload(format!(
                "{} {} is not a resource group",
                group.resource_type, group.name
            )));
        }
        if group.deleted {
            return Err(ProvisionError::ResourceDeleted(group_id));
        }

        let live: Vec<_> = members.iter().filter(|r| !r.deleted).collect();
        let missing: Vec<ResourceType> = self
            .mandatory_types
            .iter()
            .copied()
            .filter(|t| !live.iter().any(|r| r.resource_type == *t))
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "group is missing mandatory resource types");
            return Err(ProvisionError::MissingResourceType { group_id, missing });
        }

        let mut plan = Vec::new();
        for member in &live {
            let history = self.store.operations_for_resource(member.id)?;
            let Some(create) = history.iter().rev().find(|op| op.kind == OperationKind::Create)
            else {
                debug!(resource_id = %member.id, "no create operation; nothing to reschedule");
                continue;
            };
            match create.status {
                OperationStatus::Abandoned => {
                    return Err(ProvisionError::HardStop {
                        resource_id: member.id,
                        resource_type: member.resource_type,
                        operation_id: create.id,
                    })
                }
                OperationStatus::Failed | OperationStatus::NotStarted => plan.push(create.id),
                OperationStatus::DoneSuccessful
                | OperationStatus::InProgress
                | OperationStatus::Aborted => {}
            }
        }
        if plan.is_empty() {
            return Err(ProvisionError::NothingToReschedule(group_id));
        }

        for id in &plan {
            self.store.reopen(*id, self.retry_increment)?;
        }
        let batch = self
            .scheduler
            .enqueue_batch(&plan, &format!("reschedule {}", group.name))?;
        info!(batch_id = %batch.id, ops = batch.operations.len(), "resource group rescheduled");
        Ok(RescheduleOutcome {
            group_id,
            batch_id: batch.id,
            operations: batch.operations,
        })
    }
}

/// Pick the operation to redo from a history ordered oldest first.
///
/// Scanning newest first, successes newer than any failure are passed over.
/// Once a failed or abandoned operation has been seen, the next success ends
/// the scan, and the earliest failure seen so far is returned: later attempts
/// may depend on it.
pub fn find_retry_candidate(history: &[Operation]) -> Option<&Operation> {
    let mut candidate = None;
    for op in history.iter().rev() {
        if op.status.is_retryable() {
            candidate = Some(op);
        } else if op.status == OperationStatus::DoneSuccessful && candidate.is_some() {
            break;
        }
    }
    candidate
}
