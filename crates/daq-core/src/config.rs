//! Core configuration.
//!
//! Loadable from a TOML file; every field has a default so a missing file
//! or a partial file is fine. The daemon overlays CLI flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(String),

    #[error("cannot parse config file: {0}")]
    Parse(String),
}

/// Configuration of the scheduler core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Framework name presented to the outer manager on subscribe.
    pub framework_name: String,
    /// Resource role the framework subscribes under.
    pub role: String,
    /// How long the outer manager holds the framework id after a
    /// disconnect before invalidating the registration.
    pub failover_timeout_secs: u64,
    /// Registration backoff bounds.
    pub registration_min_backoff_secs: u64,
    pub registration_max_backoff_secs: u64,
    /// Log every incoming event.
    pub verbose: bool,
    /// Log offer and descriptor detail per matching cycle.
    pub very_verbose: bool,
    /// Emit a per-cycle counter summary.
    pub summary_metrics: bool,
    /// Also log per-resource-type totals for each offer.
    pub resource_type_metrics: bool,
    /// Control ports are allocated strictly above this floor.
    pub control_port_floor: u16,
    /// Dynamic data ports are allocated strictly above this floor.
    pub dynamic_port_floor: u16,
    /// One revive token becomes available per this interval.
    pub revive_rate_secs: u64,
    /// Deadline for one environment transition phase.
    pub transition_timeout_secs: u64,
    /// Terminal tasks stay readable for this long before removal.
    pub terminal_grace_secs: u64,
    /// Directory holding the identity store.
    pub data_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            framework_name: "daqgrid".to_string(),
            role: "daq".to_string(),
            failover_timeout_secs: 600,
            registration_min_backoff_secs: 1,
            registration_max_backoff_secs: 15,
            verbose: false,
            very_verbose: false,
            summary_metrics: false,
            resource_type_metrics: false,
            control_port_floor: 47100,
            dynamic_port_floor: 8999,
            revive_rate_secs: 5,
            transition_timeout_secs: 30,
            terminal_grace_secs: 60,
            data_dir: PathBuf::from("/var/lib/daqgrid"),
        }
    }
}

impl CoreConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_timeout_secs)
    }

    pub fn registration_min_backoff(&self) -> Duration {
        Duration::from_secs(self.registration_min_backoff_secs)
    }

    pub fn registration_max_backoff(&self) -> Duration {
        Duration::from_secs(self.registration_max_backoff_secs)
    }

    pub fn revive_rate(&self) -> Duration {
        Duration::from_secs(self.revive_rate_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.control_port_floor, 47100);
        assert_eq!(cfg.dynamic_port_floor, 8999);
        assert_eq!(cfg.registration_min_backoff_secs, 1);
        assert_eq!(cfg.registration_max_backoff_secs, 15);
    }

    #[test]
    fn parse_partial_toml() {
        let cfg: CoreConfig = toml::from_str(
            r#"
framework_name = "daqgrid-test"
control_port_floor = 29999
verbose = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.framework_name, "daqgrid-test");
        assert_eq!(cfg.control_port_floor, 29999);
        assert!(cfg.verbose);
        // untouched fields keep their defaults
        assert_eq!(cfg.dynamic_port_floor, 8999);
    }
}
