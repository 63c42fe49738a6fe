use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ResourceId, ResourceType};

/// A provisionable entity tracked across its lifetime.
///
/// Resources are never removed from storage; deletion is recorded through the
/// `deleted*` fields while the provider-side teardown runs asynchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub resource_type: ResourceType,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Owning resource group. `None` for groups and stand-alone resources.
    #[serde(default)]
    pub group_id: Option<ResourceId>,
    /// Last desired configuration handed in by a create/update request.
    #[serde(default)]
    pub desired_state: serde_json::Value,
    /// What the provider reported after the last successful operation.
    #[serde(default)]
    pub provider_state: Option<serde_json::Value>,
    /// Values produced by this resource's operations for later consumers
    /// (e.g. a subnet id produced by the network and read by a VM).
    #[serde(default)]
    pub shared_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<String>,
    /// Store-assigned creation sequence; orders resources within a group.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(
        resource_type: ResourceType,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            resource_type,
            name: name.into(),
            region: region.into(),
            tags: BTreeMap::new(),
            group_id: None,
            desired_state: serde_json::Value::Null,
            provider_state: None,
            shared_variables: BTreeMap::new(),
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_group(mut self, group_id: ResourceId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The group whose shared variables this resource can see: its owner, or
    /// itself when it is a group.
    pub fn scope_id(&self) -> ResourceId {
        self.group_id.unwrap_or(self.id)
    }
}
