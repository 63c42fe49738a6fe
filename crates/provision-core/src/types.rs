use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ProvisionError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identity of a provisionable resource.
    ResourceId
);
uuid_id!(
    /// Identity of one scheduled unit of provisioning work.
    OperationId
);
uuid_id!(
    /// Identity of a batch of operations delivered as one queue message.
    BatchId
);

// ---------------------------------------------------------------------------
// ResourceType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    ResourceGroup,
    StorageAccount,
    NetworkSecurityGroup,
    VirtualNetwork,
    Bastion,
    VirtualMachine,
}

impl ResourceType {
    pub fn all() -> &'static [ResourceType] {
        &[
            ResourceType::ResourceGroup,
            ResourceType::StorageAccount,
            ResourceType::NetworkSecurityGroup,
            ResourceType::VirtualNetwork,
            ResourceType::Bastion,
            ResourceType::VirtualMachine,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::ResourceGroup => "resource_group",
            ResourceType::StorageAccount => "storage_account",
            ResourceType::NetworkSecurityGroup => "network_security_group",
            ResourceType::VirtualNetwork => "virtual_network",
            ResourceType::Bastion => "bastion",
            ResourceType::VirtualMachine => "virtual_machine",
        }
    }

    /// Groups own other resources; deleting one removes its contents as a side effect.
    pub fn is_group(self) -> bool {
        matches!(self, ResourceType::ResourceGroup)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource_group" | "resource-group" => Ok(ResourceType::ResourceGroup),
            "storage_account" | "storage-account" => Ok(ResourceType::StorageAccount),
            "network_security_group" | "network-security-group" | "nsg" => {
                Ok(ResourceType::NetworkSecurityGroup)
            }
            "virtual_network" | "virtual-network" | "vnet" => Ok(ResourceType::VirtualNetwork),
            "bastion" => Ok(ResourceType::Bastion),
            "virtual_machine" | "virtual-machine" | "vm" => Ok(ResourceType::VirtualMachine),
            _ => {
                let known: Vec<&str> = ResourceType::all().iter().map(|t| t.as_str()).collect();
                Err(ProvisionError::InvalidPayload(format!(
                    "unknown resource type '{s}' (expected one of: {})",
                    known.join(", ")
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    EnsureRoles,
    EnsureFirewallRules,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::EnsureRoles => "ensure_roles",
            OperationKind::EnsureFirewallRules => "ensure_firewall_rules",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "ensure_roles" | "ensure-roles" => Ok(OperationKind::EnsureRoles),
            "ensure_firewall_rules" | "ensure-firewall-rules" => {
                Ok(OperationKind::EnsureFirewallRules)
            }
            _ => Err(ProvisionError::InvalidPayload(format!(
                "unknown operation kind '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an operation.
///
/// Transitions: `NotStarted → InProgress → DoneSuccessful | Failed`,
/// `Failed → InProgress | Abandoned`, any non-terminal state `→ Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    NotStarted,
    InProgress,
    DoneSuccessful,
    Failed,
    Abandoned,
    Aborted,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::DoneSuccessful | OperationStatus::Abandoned | OperationStatus::Aborted
        )
    }

    /// States the retry controller may re-open.
    pub fn is_retryable(self) -> bool {
        matches!(self, OperationStatus::Failed | OperationStatus::Abandoned)
    }

    /// States a dispatcher may claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, OperationStatus::NotStarted | OperationStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::NotStarted => "not_started",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::DoneSuccessful => "done_successful",
            OperationStatus::Failed => "failed",
            OperationStatus::Abandoned => "abandoned",
            OperationStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            OperationStatus::NotStarted,
            OperationStatus::InProgress,
            OperationStatus::DoneSuccessful,
            OperationStatus::Failed,
            OperationStatus::Abandoned,
            OperationStatus::Aborted,
        ]
        .into_iter()
        .find(|status| status.as_str() == s.replace('-', "_"))
        .ok_or_else(|| ProvisionError::InvalidPayload(format!("unknown operation status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_snake_and_kebab_case() {
        assert_eq!("in-progress".parse::<OperationStatus>().unwrap(), OperationStatus::InProgress);
        assert_eq!("abandoned".parse::<OperationStatus>().unwrap(), OperationStatus::Abandoned);
        assert!("finished".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(OperationStatus::DoneSuccessful.is_terminal());
        assert!(OperationStatus::Abandoned.is_terminal());
        assert!(OperationStatus::Aborted.is_terminal());
        assert!(!OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::NotStarted.is_terminal());
        assert!(!OperationStatus::InProgress.is_terminal());
    }

    #[test]
    fn resource_type_parses_aliases() {
        assert_eq!(
            "vnet".parse::<ResourceType>().unwrap(),
            ResourceType::VirtualNetwork
        );
        assert_eq!(
            "virtual-machine".parse::<ResourceType>().unwrap(),
            ResourceType::VirtualMachine
        );
        assert!("bucket".parse::<ResourceType>().is_err());
    }

    #[test]
    fn ids_round_trip_through_display() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&OperationStatus::DoneSuccessful).unwrap();
        assert_eq!(json, "\"done_successful\"");
    }
}
