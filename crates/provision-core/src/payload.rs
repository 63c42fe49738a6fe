//! Typed desired-state payloads, one per operation kind.
//!
//! Callers hand in raw JSON; [`OperationPayload::parse`] turns it into the
//! variant matching the operation kind and validates it, so malformed input is
//! rejected when work is scheduled rather than when a driver runs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{ProvisionError, Result};
use crate::types::OperationKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Create(ResourceSpec),
    Update(ResourceSpec),
    Delete(DeleteSpec),
    EnsureRoles(RoleAssignments),
    EnsureFirewallRules(FirewallRules),
}

/// Type-specific configuration for create/update. Opaque to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteSpec {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignments {
    pub assignments: Vec<RoleAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub principal_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallRules {
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub priority: u16,
    pub direction: Direction,
    #[serde(default = "default_rule_action")]
    pub action: RuleAction,
    /// `*` or an IPv4 CIDR block.
    pub source: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

fn default_rule_action() -> RuleAction {
    RuleAction::Allow
}

const MIN_RULE_PRIORITY: u16 = 100;
const MAX_RULE_PRIORITY: u16 = 4096;

impl OperationPayload {
    /// Parse raw JSON as the payload for `kind` and validate it.
    ///
    /// `null` is accepted as an empty object so kinds without required fields
    /// (delete, create with no settings) can be scheduled without a body.
    pub fn parse(kind: OperationKind, raw: serde_json::Value) -> Result<Self> {
        let mut object = match raw {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(ProvisionError::InvalidPayload(format!(
                    "{kind} payload must be a JSON object, got {other}"
                )))
            }
        };
        object.insert(
            "kind".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );
        let payload: OperationPayload = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| ProvisionError::InvalidPayload(format!("{kind}: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Create(_) => OperationKind::Create,
            OperationPayload::Update(_) => OperationKind::Update,
            OperationPayload::Delete(_) => OperationKind::Delete,
            OperationPayload::EnsureRoles(_) => OperationKind::EnsureRoles,
            OperationPayload::EnsureFirewallRules(_) => OperationKind::EnsureFirewallRules,
        }
    }

    /// Settings carried by create/update, if any.
    pub fn settings(&self) -> Option<&serde_json::Value> {
        match self {
            OperationPayload::Create(spec) | OperationPayload::Update(spec) => Some(&spec.settings),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            OperationPayload::Create(spec) | OperationPayload::Update(spec) => {
                if !(spec.settings.is_object() || spec.settings.is_null()) {
                    return Err(ProvisionError::InvalidPayload(
                        "settings must be a JSON object".into(),
                    ));
                }
                Ok(())
            }
            OperationPayload::Delete(_) => Ok(()),
            OperationPayload::EnsureRoles(roles) => roles.validate(),
            OperationPayload::EnsureFirewallRules(rules) => rules.validate(),
        }
    }
}

impl RoleAssignments {
    fn validate(&self) -> Result<()> {
        if self.assignments.is_empty() {
            return Err(ProvisionError::InvalidPayload(
                "ensure_roles requires at least one assignment".into(),
            ));
        }
        for a in &self.assignments {
            if a.principal_id.trim().is_empty() || a.role.trim().is_empty() {
                return Err(ProvisionError::InvalidPayload(
                    "role assignment needs a principal_id and a role".into(),
                ));
            }
        }
        Ok(())
    }
}

impl FirewallRules {
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ProvisionError::InvalidPayload(
                    "firewall rule name must not be empty".into(),
                ));
            }
            if !(MIN_RULE_PRIORITY..=MAX_RULE_PRIORITY).contains(&rule.priority) {
                return Err(ProvisionError::InvalidPayload(format!(
                    "rule '{}': priority {} outside {MIN_RULE_PRIORITY}..={MAX_RULE_PRIORITY}",
                    rule.name, rule.priority
                )));
            }
            if !seen.insert((rule.direction, rule.priority)) {
                return Err(ProvisionError::InvalidPayload(format!(
                    "rule '{}': duplicate priority {} for direction {:?}",
                    rule.name, rule.priority, rule.direction
                )));
            }
            if !is_valid_source(&rule.source) {
                return Err(ProvisionError::InvalidPayload(format!(
                    "rule '{}': source '{}' is not '*' or an IPv4 CIDR",
                    rule.name, rule.source
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_source(source: &str) -> bool {
    if source == "*" {
        return true;
    }
    let (addr, prefix) = match source.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (source, None),
    };
    if addr.parse::<Ipv4Addr>().is_err() {
        return false;
    }
    match prefix {
        None => true,
        Some(p) => p.parse::<u8>().map(|n| n <= 32).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_null_as_empty_create() {
        let payload = OperationPayload::parse(OperationKind::Create, serde_json::Value::Null).unwrap();
        assert_eq!(payload.kind(), OperationKind::Create);
        assert_eq!(payload.settings(), Some(&serde_json::Value::Null));
    }

    #[test]
    fn parse_create_keeps_settings() {
        let payload = OperationPayload::parse(
            OperationKind::Create,
            json!({ "settings": { "address_space": "10.0.0.0/16" } }),
        )
        .unwrap();
        assert_eq!(
            payload.settings().unwrap()["address_space"],
            json!("10.0.0.0/16")
        );
    }

    #[test]
    fn parse_rejects_non_object() {
        let err = OperationPayload::parse(OperationKind::Update, json!([1, 2])).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPayload(_)));
    }

    #[test]
    fn ensure_roles_requires_assignments() {
        let err = OperationPayload::parse(OperationKind::EnsureRoles, json!({ "assignments": [] }))
            .unwrap_err();
        assert!(err.to_string().contains("at least one assignment"));
    }

    #[test]
    fn firewall_rules_validate_priority_and_source() {
        let ok = OperationPayload::parse(
            OperationKind::EnsureFirewallRules,
            json!({ "rules": [
                { "name": "ssh", "priority": 200, "direction": "inbound", "source": "10.1.0.0/24", "port": 22 },
                { "name": "out", "priority": 200, "direction": "outbound", "source": "*" }
            ]}),
        );
        assert!(ok.is_ok());

        let bad_priority = OperationPayload::parse(
            OperationKind::EnsureFirewallRules,
            json!({ "rules": [{ "name": "x", "priority": 5, "direction": "inbound", "source": "*" }] }),
        );
        assert!(bad_priority.is_err());

        let bad_source = OperationPayload::parse(
            OperationKind::EnsureFirewallRules,
            json!({ "rules": [{ "name": "x", "priority": 300, "direction": "inbound", "source": "10.0.0.0/40" }] }),
        );
        assert!(bad_source.is_err());
    }

    #[test]
    fn firewall_rules_reject_duplicate_priority() {
        let err = OperationPayload::parse(
            OperationKind::EnsureFirewallRules,
            json!({ "rules": [
                { "name": "a", "priority": 300, "direction": "inbound", "source": "*" },
                { "name": "b", "priority": 300, "direction": "inbound", "source": "*" }
            ]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate priority"));
    }
}
