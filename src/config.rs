use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use thiserror::Error;

use crate::reconciliation::types::SafetyMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read",
            ConfigError::Parse { .. } => "config_parse",
            ConfigError::Invalid(_) => "config_invalid",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// When false, sqlx statement logging is silenced
    #[serde(default)]
    pub enable_tracing: bool,
    /// PostgreSQL connection URL. The in-memory store is used when absent.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub latch_release: LatchReleaseConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
}

/// Reconciliation sweep settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Lag above this value is a breach
    pub lag_threshold: i64,
    /// State older than this is stale. 0 disables the staleness check.
    pub state_stale_ms: i64,
    pub safety_mode: SafetyMode,
    pub auto_switch_enabled: bool,
    pub safety_latch_enabled: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            lag_threshold: 10,
            state_stale_ms: 30_000,
            safety_mode: SafetyMode::CancelOnly,
            auto_switch_enabled: true,
            safety_latch_enabled: true,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Invariant guard settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub auto_switch_enabled: bool,
    pub safety_mode: SafetyMode,
    /// Failing checks in a row before tracked symbols are switched
    pub trigger_after_consecutive: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            auto_switch_enabled: true,
            safety_mode: SafetyMode::CancelOnly,
            trigger_after_consecutive: 1,
        }
    }
}

impl GuardConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LatchReleaseConfig {
    /// Let a release through when every invariant violation is a negative balance
    pub allow_negative_balance_violations: bool,
}

/// Peer service that applies symbol trading modes
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ActuatorConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8080".to_string(),
            timeout_ms: 1_500,
        }
    }
}

impl ActuatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&config_path, &content)
    }

    pub fn from_yaml(path: &str, content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciliation.lag_threshold < 0 {
            return Err(ConfigError::Invalid(
                "reconciliation.lag_threshold must be >= 0".to_string(),
            ));
        }
        if self.reconciliation.state_stale_ms < 0 {
            return Err(ConfigError::Invalid(
                "reconciliation.state_stale_ms must be >= 0".to_string(),
            ));
        }
        if self.guard.trigger_after_consecutive == 0 {
            return Err(ConfigError::Invalid(
                "guard.trigger_after_consecutive must be >= 1".to_string(),
            ));
        }
        if self.actuator.enabled && self.actuator.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "actuator.base_url is required when the actuator is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledger.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = AppConfig::from_yaml("inline", MINIMAL).unwrap();
        assert!(config.postgres_url.is_none());
        assert_eq!(config.reconciliation.lag_threshold, 10);
        assert_eq!(config.reconciliation.state_stale_ms, 30_000);
        assert_eq!(config.reconciliation.safety_mode, SafetyMode::CancelOnly);
        assert!(config.reconciliation.safety_latch_enabled);
        assert_eq!(config.guard.interval(), Duration::from_secs(30));
        assert_eq!(config.guard.trigger_after_consecutive, 1);
        assert!(!config.latch_release.allow_negative_balance_violations);
        assert_eq!(config.actuator.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_section_overrides() {
        let yaml = format!(
            "{}\nreconciliation:\n  lag_threshold: 3\n  safety_mode: HARD_HALT\nguard:\n  trigger_after_consecutive: 2\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml("inline", &yaml).unwrap();
        assert_eq!(config.reconciliation.lag_threshold, 3);
        assert_eq!(config.reconciliation.safety_mode, SafetyMode::HardHalt);
        assert_eq!(config.reconciliation.interval_ms, 5_000);
        assert_eq!(config.guard.trigger_after_consecutive, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let yaml = format!("{}\nguard:\n  trigger_after_consecutive: 0\n", MINIMAL);
        let err = AppConfig::from_yaml("inline", &yaml).unwrap_err();
        assert_eq!(err.code(), "config_invalid");

        let err = AppConfig::from_yaml("inline", "log_level: [").unwrap_err();
        assert_eq!(err.code(), "config_parse");
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load("does-not-exist").unwrap_err();
        assert_eq!(err.code(), "config_read");
    }
}
