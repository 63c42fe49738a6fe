use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::payload::OperationPayload;
use crate::types::{BatchId, OperationId, OperationKind, OperationStatus, ResourceId};

/// Abort reason recorded when the target resource has been soft-deleted.
pub const ABORT_RESOURCE_DELETED: &str = "resource deleted";
/// Abort reason recorded when a predecessor was aborted or abandoned.
pub const ABORT_DEPENDENCY_FAILED: &str = "dependency failed";

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One scheduled unit of provisioning work against a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub payload: OperationPayload,
    pub status: OperationStatus,
    pub try_count: u32,
    pub max_try_count: u32,
    /// The single predecessor that must reach `DoneSuccessful` first.
    #[serde(default)]
    pub depends_on: Option<OperationId>,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    pub description: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub abort_reason: Option<String>,
    /// Worker session that last claimed this operation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Incremented on every write; used for compare-and-set.
    pub version: u64,
    /// Store-assigned creation sequence; orders a resource's history.
    pub seq: u64,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// NewOperation
// ---------------------------------------------------------------------------

/// Input to `OperationStore::create_operation`.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub resource_id: ResourceId,
    pub payload: OperationPayload,
    pub depends_on: Option<OperationId>,
    pub description: String,
}

impl NewOperation {
    pub fn new(resource_id: ResourceId, payload: OperationPayload) -> Self {
        let description = format!("{} {resource_id}", payload.kind());
        Self {
            resource_id,
            payload,
            depends_on: None,
            description,
        }
    }

    pub fn depends_on(mut self, predecessor: OperationId) -> Self {
        self.depends_on = Some(predecessor);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// How a claimed operation finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Succeeded {
        provider_state: Option<serde_json::Value>,
        shared_variables: BTreeMap<String, String>,
    },
    /// Counted against the retry budget.
    TransientFailure { error: String },
    /// Validation-type failure; abandons regardless of remaining budget.
    PermanentFailure { error: String },
}

impl Completion {
    pub fn success() -> Self {
        Completion::Succeeded {
            provider_state: None,
            shared_variables: BTreeMap::new(),
        }
    }
}
