//! Resource-type drivers: the pluggable side that actually talks to a provider.
//!
//! Drivers must be idempotent (create-or-get, delete-if-exists). A call may be
//! cancelled through `DriverParams::cancel` and later repeated by a retry, so
//! any partial side effect has to be safe to redo.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ProvisionError, Result};
use crate::payload::OperationPayload;
use crate::types::{OperationKind, ResourceId, ResourceType};

// ---------------------------------------------------------------------------
// Params / output / error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverParams {
    pub resource_id: ResourceId,
    pub resource_type: ResourceType,
    pub name: String,
    pub region: String,
    pub tags: BTreeMap<String, String>,
    pub payload: OperationPayload,
    pub desired_state: serde_json::Value,
    /// Variables produced by earlier operations in the same resource group.
    pub shared_variables: BTreeMap<String, String>,
    /// Cancelled when the resource is deleted or the operation aborted mid-call.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverOutput {
    pub provider_state: Option<serde_json::Value>,
    pub shared_variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying within the operation's budget.
    Transient,
    /// Validation-type failure; retrying cannot help.
    Permanent,
    /// The call stopped because its cancellation token fired.
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{class} driver error: {message}")]
pub struct DriverError {
    pub class: ErrorClass,
    pub message: String,
}

impl DriverError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            class: ErrorClass::Cancelled,
            message: "cancellation requested".to_string(),
        }
    }
}

pub type DriverResult = std::result::Result<DriverOutput, DriverError>;

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Driver: Send + Sync {
    async fn ensure_created(&self, params: &DriverParams) -> DriverResult;

    /// Also receives the reconciliation kinds (`ensure_roles`, `ensure_firewall_rules`).
    async fn update(&self, params: &DriverParams) -> DriverResult;

    async fn ensure_deleted(&self, params: &DriverParams) -> DriverResult;

    /// Read back the variables a resource exposes to its group without changing it.
    async fn get_shared_variables(&self, params: &DriverParams) -> DriverResult;
}

/// Route an operation kind to the matching driver entry point.
pub async fn invoke(driver: &dyn Driver, kind: OperationKind, params: &DriverParams) -> DriverResult {
    match kind {
        OperationKind::Create => driver.ensure_created(params).await,
        OperationKind::Update | OperationKind::EnsureRoles | OperationKind::EnsureFirewallRules => {
            driver.update(params).await
        }
        OperationKind::Delete => driver.ensure_deleted(params).await,
    }
}

// ---------------------------------------------------------------------------
// DriverRegistry
// ---------------------------------------------------------------------------

/// Maps resource types to their drivers.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<ResourceType, Arc<dyn Driver>>,
    fallback: Option<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, resource_type: ResourceType, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(resource_type, driver);
        self
    }

    /// Driver used for any type without its own registration.
    pub fn with_fallback(mut self, driver: Arc<dyn Driver>) -> Self {
        self.fallback = Some(driver);
        self
    }

    pub fn get(&self, resource_type: ResourceType) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(&resource_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(ProvisionError::DriverNotFound(resource_type))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.drivers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{DeleteSpec, ResourceSpec};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Driver for Recorder {
        async fn ensure_created(&self, _: &DriverParams) -> DriverResult {
            self.calls.lock().unwrap().push("ensure_created");
            Ok(DriverOutput::default())
        }
        async fn update(&self, _: &DriverParams) -> DriverResult {
            self.calls.lock().unwrap().push("update");
            Ok(DriverOutput::default())
        }
        async fn ensure_deleted(&self, _: &DriverParams) -> DriverResult {
            self.calls.lock().unwrap().push("ensure_deleted");
            Ok(DriverOutput::default())
        }
        async fn get_shared_variables(&self, _: &DriverParams) -> DriverResult {
            self.calls.lock().unwrap().push("get_shared_variables");
            Ok(DriverOutput::default())
        }
    }

    fn params(payload: OperationPayload) -> DriverParams {
        DriverParams {
            resource_id: ResourceId::new(),
            resource_type: ResourceType::NetworkSecurityGroup,
            name: "nsg-1".into(),
            region: "norwayeast".into(),
            tags: BTreeMap::new(),
            payload,
            desired_state: serde_json::Value::Null,
            shared_variables: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn invoke_routes_by_kind() {
        let driver = Recorder::default();
        let create = params(OperationPayload::Create(ResourceSpec::default()));
        let delete = params(OperationPayload::Delete(DeleteSpec::default()));
        invoke(&driver, OperationKind::Create, &create).await.unwrap();
        invoke(&driver, OperationKind::EnsureFirewallRules, &create).await.unwrap();
        invoke(&driver, OperationKind::Delete, &delete).await.unwrap();
        assert_eq!(
            *driver.calls.lock().unwrap(),
            vec!["ensure_created", "update", "ensure_deleted"]
        );
    }

    #[test]
    fn registry_falls_back_then_errors() {
        let specific: Arc<dyn Driver> = Arc::new(Recorder::default());
        let registry = DriverRegistry::new().register(ResourceType::Bastion, specific);
        assert!(registry.get(ResourceType::Bastion).is_ok());
        assert!(matches!(
            registry.get(ResourceType::VirtualMachine),
            Err(ProvisionError::DriverNotFound(ResourceType::VirtualMachine))
        ));

        let registry = registry.with_fallback(Arc::new(Recorder::default()));
        assert!(registry.get(ResourceType::VirtualMachine).is_ok());
    }

    #[test]
    fn driver_error_display_includes_class() {
        let e = DriverError::transient("throttled");
        assert_eq!(e.to_string(), "transient driver error: throttled");
    }
}
