use thiserror::Error;

use crate::types::{OperationId, OperationStatus, ResourceId, ResourceType};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("resource not found: {0}")]
    InvalidResource(ResourceId),

    #[error("resource {0} is deleted: only delete operations may be scheduled")]
    ResourceDeleted(ResourceId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("precondition failed for operation {op_id}: {reason}")]
    PreconditionFailed { op_id: OperationId, reason: String },

    #[error("concurrent modification of operation {op_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        op_id: OperationId,
        expected: u64,
        actual: u64,
    },

    #[error("invalid transition for operation {op_id} from {from} to {to}")]
    InvalidTransition {
        op_id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("resource group {group_id} is missing mandatory resource types: {}", join_types(missing))]
    MissingResourceType {
        group_id: ResourceId,
        missing: Vec<ResourceType>,
    },

    #[error(
        "hard stop: create operation {operation_id} for {resource_type} {resource_id} is abandoned and needs manual intervention"
    )]
    HardStop {
        resource_id: ResourceId,
        resource_type: ResourceType,
        operation_id: OperationId,
    },

    #[error("nothing to reschedule in resource group {0}")]
    NothingToReschedule(ResourceId),

    #[error("no retryable operation for resource {0}")]
    NothingToRetry(ResourceId),

    #[error("no driver registered for resource type {0}")]
    DriverNotFound(ResourceType),

    #[error("queue message not found: {0}")]
    MessageNotFound(uuid::Uuid),

    #[error("lease lost for queue message {0}: it was redelivered")]
    LeaseLost(uuid::Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Errors that mean another actor got there first; callers skip and rely
    /// on redelivery.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ProvisionError::PreconditionFailed { .. } | ProvisionError::ConcurrencyConflict { .. }
        )
    }
}

fn join_types(types: &[ResourceType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a redb error (or any displayable storage error) into `ProvisionError::Storage`.
pub(crate) fn storage<E: std::fmt::Display>(e: E) -> ProvisionError {
    ProvisionError::Storage(e.to_string())
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
