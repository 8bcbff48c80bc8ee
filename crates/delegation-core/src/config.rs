use std::collections::HashSet;
use std::path::Path;

use agent_handlers::AgentKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::{default_scopes, AgentPermissionScope, PermissionScopeTable};
use crate::vault::{AesGcmVault, VaultError};

pub const DEFAULT_VAULT_SECRET_ENV: &str = "DELEGATION_VAULT_SECRET";

/// Upper bound for session durations and renewal windows (ten years).
pub const MAX_SESSION_SECS: i64 = 10 * 365 * 24 * 60 * 60;
/// Upper bound for audit retention (one hundred years).
pub const MAX_RETENTION_DAYS: i64 = 100 * 365;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the engine needs at startup, passed explicitly to the
/// components that use it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub agents: Vec<AgentPermissionScope>,
    pub session: SessionSettings,
    pub audit: AuditSettings,
    pub vault: VaultSettings,
    pub router: RouterSettings,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            agents: default_scopes(),
            session: SessionSettings::default(),
            audit: AuditSettings::default(),
            vault: VaultSettings::default(),
            router: RouterSettings::default(),
        }
    }
}

impl DelegationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for scope in &self.agents {
            if !seen.insert(scope.agent) {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}' is configured more than once",
                    scope.agent
                )));
            }
            if scope.allowed_actions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}' has an empty action allow-list",
                    scope.agent
                )));
            }
        }
        if !(1..=MAX_SESSION_SECS).contains(&self.session.default_duration_secs) {
            return Err(ConfigError::Invalid(format!(
                "session.default_duration_secs must be between 1 and {MAX_SESSION_SECS}"
            )));
        }
        if !(0..=MAX_SESSION_SECS).contains(&self.session.renewal_window_secs) {
            return Err(ConfigError::Invalid(format!(
                "session.renewal_window_secs must be between 0 and {MAX_SESSION_SECS}"
            )));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.audit.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "audit.retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.audit.index_capacity == 0 {
            return Err(ConfigError::Invalid(
                "audit.index_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(fallback) = self.router.fallback_agent {
            if !seen.contains(&fallback) {
                return Err(ConfigError::Invalid(format!(
                    "fallback agent '{}' has no permission scope",
                    fallback
                )));
            }
        }
        Ok(())
    }

    pub fn scope_table(&self) -> PermissionScopeTable {
        PermissionScopeTable::from_scopes(self.agents.iter().cloned())
    }

    /// Opens the vault from the environment variable named in `vault.secret_env`.
    pub fn open_vault(&self) -> Result<AesGcmVault, VaultError> {
        AesGcmVault::from_env(&self.vault.secret_env)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub default_duration_secs: i64,
    /// Auto-renewing keys are renewed at the gate once expiry is this close.
    pub renewal_window_secs: i64,
    pub default_max_renewals: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_duration_secs: 3_600,
            renewal_window_secs: 300,
            default_max_renewals: 3,
        }
    }
}

/// Accessors clamp into the validated range so unvalidated settings cannot
/// overflow chrono arithmetic.
impl SessionSettings {
    pub fn default_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_duration_secs.clamp(0, MAX_SESSION_SECS))
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_window_secs.clamp(0, MAX_SESSION_SECS))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub retention_days: i64,
    /// Most recent entries kept per session, wallet and user index.
    pub index_capacity: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            retention_days: 90,
            index_capacity: 100,
        }
    }
}

impl AuditSettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.clamp(0, MAX_RETENTION_DAYS))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    pub secret_env: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            secret_env: DEFAULT_VAULT_SECRET_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub fallback_agent: Option<AgentKind>,
}
