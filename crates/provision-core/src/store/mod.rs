//! Durable records of resources and operations, and the operation state machine.
//!
//! Every status transition is decided inside a single storage transaction:
//! the current record is read, its status (and, for claims, its version) is
//! compared against what the caller last observed, and the new record is
//! written with `version + 1`. Two dispatchers racing for the same operation
//! therefore cannot both claim it; the loser gets `PreconditionFailed` or
//! `ConcurrencyConflict` and skips the delivery.

pub mod db;

use serde::Serialize;
use std::time::Duration;

use crate::error::Result;
use crate::operation::{Completion, NewOperation, Operation};
use crate::resource::Resource;
use crate::types::{
    BatchId, OperationId, OperationKind, OperationStatus, ResourceId, ResourceType,
};

pub use db::RedbStore;

pub trait OperationStore: Send + Sync {
    // -- resources ----------------------------------------------------------

    /// Persist a new resource. Fails `InvalidResource` if its group is unknown.
    fn create_resource(&self, resource: Resource) -> Result<Resource>;

    fn get_resource(&self, id: ResourceId) -> Result<Resource>;

    /// All resources, oldest first.
    fn list_resources(&self) -> Result<Vec<Resource>>;

    /// The group resource itself plus every resource it owns, oldest first.
    fn resources_in_group(&self, group_id: ResourceId) -> Result<Vec<Resource>>;

    /// Atomically flag the resource deleted. Returns `false` if it already was.
    fn mark_resource_deleted(&self, id: ResourceId, actor: &str) -> Result<(Resource, bool)>;

    // -- operations ---------------------------------------------------------

    fn create_operation(&self, new: NewOperation) -> Result<Operation>;

    fn get_operation(&self, id: OperationId) -> Result<Operation>;

    /// A resource's operation history, oldest first.
    fn operations_for_resource(&self, id: ResourceId) -> Result<Vec<Operation>>;

    /// All operations, optionally filtered by status, oldest first.
    fn list_operations(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>>;

    fn assign_batch(&self, ops: &[OperationId], batch_id: BatchId) -> Result<()>;

    /// Claim an operation for `session_id`.
    ///
    /// Succeeds only if the record still has `expected_version`, its status is
    /// `NotStarted` or `Failed`, and its predecessor (if any) is `DoneSuccessful`.
    fn set_in_progress(
        &self,
        id: OperationId,
        expected_version: u64,
        session_id: &str,
    ) -> Result<Operation>;

    /// Refresh the claim heartbeat. Fails if `session_id` no longer holds the claim.
    fn heartbeat(&self, id: OperationId, session_id: &str) -> Result<Operation>;

    /// Record the outcome of a claimed operation.
    fn complete(&self, id: OperationId, session_id: &str, completion: Completion)
        -> Result<Operation>;

    /// Move a non-terminal operation to `Aborted`.
    fn abort(&self, id: OperationId, reason: &str) -> Result<Operation>;

    /// Give an operation `increment` more tries. `Failed` and `Abandoned`
    /// operations move back to `Failed`; `NotStarted` ones keep their status.
    fn reopen(&self, id: OperationId, increment: u32) -> Result<Operation>;

    /// Return the single non-terminal DELETE for `resource_id`, creating one
    /// if none exists. The boolean is `true` when a new operation was created.
    fn ensure_delete_operation(
        &self,
        resource_id: ResourceId,
        description: &str,
    ) -> Result<(Operation, bool)>;

    /// Fail `InProgress` operations whose heartbeat is older than `max_age`.
    fn recover_stale(&self, max_age: Duration) -> Result<Vec<Operation>>;

    /// Abandoned operations with enough context for an operator to act.
    fn list_abandoned(&self) -> Result<Vec<AbandonedOperation>> {
        let mut out = Vec::new();
        for op in self.list_operations(Some(OperationStatus::Abandoned))? {
            let resource = self.get_resource(op.resource_id)?;
            out.push(AbandonedOperation {
                operation_id: op.id,
                resource_id: resource.id,
                resource_type: resource.resource_type,
                resource_name: resource.name,
                kind: op.kind,
                try_count: op.try_count,
                max_try_count: op.max_try_count,
                last_error: op.last_error,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AbandonedOperation {
    pub operation_id: OperationId,
    pub resource_id: ResourceId,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub kind: OperationKind,
    pub try_count: u32,
    pub max_try_count: u32,
    pub last_error: Option<String>,
}
