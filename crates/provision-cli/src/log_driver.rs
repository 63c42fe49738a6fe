use async_trait::async_trait;
use provision_core::driver::{Driver, DriverOutput, DriverParams, DriverResult};
use std::collections::BTreeMap;
use tracing::info;

/// Stand-in driver for every resource type: records what it would have done
/// and reports success. Lets a root be exercised end to end without a cloud.
pub struct LogDriver;

impl LogDriver {
    fn output(params: &DriverParams, action: &str) -> DriverOutput {
        let mut shared_variables = BTreeMap::new();
        if action != "deleted" {
            shared_variables.insert(
                format!("{}_id", params.resource_type),
                format!("{}/{}", params.region, params.name),
            );
        }
        DriverOutput {
            provider_state: Some(serde_json::json!({
                "driver": "log",
                "action": action,
                "name": params.name,
                "region": params.region,
                "settings": params.payload.settings(),
            })),
            shared_variables,
        }
    }
}

#[async_trait]
impl Driver for LogDriver {
    async fn ensure_created(&self, params: &DriverParams) -> DriverResult {
        info!(
            resource_type = %params.resource_type,
            name = %params.name,
            region = %params.region,
            visible_vars = params.shared_variables.len(),
            "create"
        );
        Ok(Self::output(params, "created"))
    }

    async fn update(&self, params: &DriverParams) -> DriverResult {
        info!(
            resource_type = %params.resource_type,
            name = %params.name,
            kind = %params.payload.kind(),
            "update"
        );
        Ok(Self::output(params, "updated"))
    }

    async fn ensure_deleted(&self, params: &DriverParams) -> DriverResult {
        info!(resource_type = %params.resource_type, name = %params.name, "delete");
        Ok(Self::output(params, "deleted"))
    }

    async fn get_shared_variables(&self, params: &DriverParams) -> DriverResult {
        Ok(DriverOutput {
            provider_state: None,
            shared_variables: Self::output(params, "read").shared_variables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_core::driver::invoke;
    use provision_core::payload::OperationPayload;
    use provision_core::types::{OperationKind, ResourceId, ResourceType};
    use tokio_util::sync::CancellationToken;

    fn params(kind: OperationKind) -> DriverParams {
        DriverParams {
            resource_id: ResourceId::new(),
            resource_type: ResourceType::VirtualNetwork,
            name: "vnet-1".to_string(),
            region: "norwayeast".to_string(),
            tags: BTreeMap::new(),
            payload: OperationPayload::parse(kind, serde_json::json!({})).unwrap(),
            desired_state: serde_json::Value::Null,
            shared_variables: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn create_exposes_an_id_variable() {
        let out = invoke(&LogDriver, OperationKind::Create, &params(OperationKind::Create))
            .await
            .unwrap();
        assert_eq!(
            out.shared_variables.get("virtual_network_id").map(String::as_str),
            Some("norwayeast/vnet-1")
        );
        assert_eq!(out.provider_state.unwrap()["action"], "created");
    }

    #[tokio::test]
    async fn delete_exposes_nothing() {
        let out = invoke(&LogDriver, OperationKind::Delete, &params(OperationKind::Delete))
            .await
            .unwrap();
        assert!(out.shared_variables.is_empty());
    }
}
