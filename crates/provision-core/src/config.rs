use crate::error::Result;
use crate::paths;
use crate::types::{OperationKind, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a dequeued batch stays hidden before it is redelivered.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// How long an idle worker waits before polling again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of dispatchers a worker process runs in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Visibility extension, heartbeat and cancellation check period.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a cancelled driver call may take to wind down before it is dropped.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// An in-progress operation without a heartbeat for this long is recovered.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_cancel_grace_ms() -> u64 {
    30_000
}

fn default_stale_claim_secs() -> u64 {
    600
}

fn default_stale_check_interval_secs() -> u64 {
    60
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            stale_claim_secs: default_stale_claim_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
        }
    }
}

impl DispatcherConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn stale_claim_age(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Tries a new operation gets before it is abandoned.
    #[serde(default = "default_max_tries")]
    pub default_max_tries: u32,
    /// Tries added when an operator retries or reschedules.
    #[serde(default = "default_retry_increment")]
    pub retry_increment: u32,
    /// Backoff before a transiently failed batch is redelivered.
    #[serde(default = "default_delay_secs")]
    pub default_delay_secs: u64,
    /// Backoff overrides keyed `<resource_type>` or `<resource_type>.<kind>`.
    #[serde(default = "default_delays")]
    pub delays: HashMap<String, u64>,
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_increment() -> u32 {
    2
}

fn default_delay_secs() -> u64 {
    20
}

fn default_delays() -> HashMap<String, u64> {
    let mut m = HashMap::new();
    m.insert("virtual_machine.create".to_string(), 60);
    m.insert("bastion.create".to_string(), 60);
    m.insert("resource_group.delete".to_string(), 120);
    m
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_tries: default_max_tries(),
            retry_increment: default_retry_increment(),
            default_delay_secs: default_delay_secs(),
            delays: default_delays(),
        }
    }
}

impl RetryConfig {
    /// Most specific backoff for a resource type and operation kind.
    pub fn delay_for(&self, resource_type: ResourceType, kind: OperationKind) -> Duration {
        let specific = format!("{}.{}", resource_type.as_str(), kind.as_str());
        let secs = self
            .delays
            .get(&specific)
            .or_else(|| self.delays.get(resource_type.as_str()))
            .copied()
            .unwrap_or(self.default_delay_secs);
        Duration::from_secs(secs)
    }
}

// ---------------------------------------------------------------------------
// GroupConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Resource types a group must contain before it can be rescheduled.
    #[serde(default = "default_mandatory_types")]
    pub mandatory_types: Vec<ResourceType>,
}

fn default_mandatory_types() -> Vec<ResourceType> {
    vec![
        ResourceType::ResourceGroup,
        ResourceType::StorageAccount,
        ResourceType::NetworkSecurityGroup,
        ResourceType::VirtualNetwork,
        ResourceType::Bastion,
    ]
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            mandatory_types: default_mandatory_types(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProvisionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub groups: GroupConfig,
}

impl ProvisionConfig {
    /// Load `.provision/config.yaml`, falling back to defaults when it does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: ProvisionConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.retry.default_max_tries == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retry.default_max_tries must be at least 1".to_string(),
            });
        }
        if self.retry.retry_increment == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "retry.retry_increment=0: operator retries will not add any tries"
                    .to_string(),
            });
        }

        let visibility_ms = self.queue.visibility_timeout_secs.saturating_mul(1000);
        if self.dispatcher.heartbeat_interval_ms >= visibility_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "dispatcher.heartbeat_interval_ms={} must be shorter than queue.visibility_timeout_secs={}",
                    self.dispatcher.heartbeat_interval_ms, self.queue.visibility_timeout_secs
                ),
            });
        }

        if self.dispatcher.workers == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "dispatcher.workers must be at least 1".to_string(),
            });
        }

        for key in self.retry.delays.keys() {
            let (type_part, kind_part) = match key.split_once('.') {
                Some((t, k)) => (t, Some(k)),
                None => (key.as_str(), None),
            };
            if type_part.parse::<ResourceType>().is_err() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("unknown resource type '{type_part}' in retry.delays"),
                });
            }
            if let Some(kind) = kind_part {
                if kind.parse::<OperationKind>().is_err() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("unknown operation kind '{kind}' in retry.delays"),
                    });
                }
            }
        }

        if self.groups.mandatory_types.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "groups.mandatory_types is empty: reschedule will not validate groups"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_no_warnings() {
        assert!(ProvisionConfig::default().validate().is_empty());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = ProvisionConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.retry.default_max_tries, 3);
        assert_eq!(cfg.queue.visibility_timeout_secs, 30);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = ProvisionConfig::default();
        cfg.retry.default_max_tries = 7;
        cfg.save(dir.path()).unwrap();
        let loaded = ProvisionConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.retry.default_max_tries, 7);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: ProvisionConfig = serde_yaml::from_str("retry:\n  retry_increment: 5\n").unwrap();
        assert_eq!(cfg.retry.retry_increment, 5);
        assert_eq!(cfg.retry.default_max_tries, 3);
        assert_eq!(cfg.dispatcher.workers, 4);
        assert_eq!(cfg.groups.mandatory_types.len(), 5);
    }

    #[test]
    fn delay_prefers_most_specific_key() {
        let mut retry = RetryConfig::default();
        retry.delays.insert("virtual_network".to_string(), 45);
        assert_eq!(
            retry.delay_for(ResourceType::VirtualMachine, OperationKind::Create),
            Duration::from_secs(60)
        );
        assert_eq!(
            retry.delay_for(ResourceType::VirtualNetwork, OperationKind::Update),
            Duration::from_secs(45)
        );
        assert_eq!(
            retry.delay_for(ResourceType::StorageAccount, OperationKind::Create),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn validate_flags_heartbeat_not_shorter_than_visibility() {
        let mut cfg = ProvisionConfig::default();
        cfg.dispatcher.heartbeat_interval_ms = 30_000;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("heartbeat_interval_ms")));
    }

    #[test]
    fn validate_flags_unknown_delay_keys() {
        let mut cfg = ProvisionConfig::default();
        cfg.retry.delays.insert("bucket.create".to_string(), 10);
        cfg.retry.delays.insert("bastion.explode".to_string(), 10);
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.message.contains("'bucket'")));
        assert!(warnings.iter().any(|w| w.message.contains("'explode'")));
    }
}
