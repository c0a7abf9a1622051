//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::{DEFAULT_CAPACITY, HISTORY_CAPACITY};
use crate::{Result, TelemuxError};

/// Configuration of a [`Telemux`](crate::Telemux) instance.
///
/// ```rust
/// use telemux::TelemuxConfig;
///
/// let config = TelemuxConfig::from_yaml("session_capacity: 250\nsession_idle_ttl_secs: ~\n").unwrap();
/// assert_eq!(config.session_capacity, 250);
/// assert_eq!(config.history_capacity, 600);
/// assert!(config.session_idle_ttl().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemuxConfig {
    /// Capacity of each client channel
    pub session_capacity: usize,
    /// Capacity of each history session channel
    pub history_capacity: usize,
    /// Idle seconds before a stream sends a keepalive probe
    pub keepalive_secs: u64,
    /// Idle seconds before a detached session is removed; `None` keeps sessions forever
    pub session_idle_ttl_secs: Option<u64>,
    /// Seconds between idle-session sweeps
    pub reaper_interval_secs: u64,
}

impl Default for TelemuxConfig {
    fn default() -> Self {
        Self {
            session_capacity: DEFAULT_CAPACITY,
            history_capacity: HISTORY_CAPACITY,
            keepalive_secs: 30,
            session_idle_ttl_secs: Some(3600),
            reaper_interval_secs: 60,
        }
    }
}

impl TelemuxConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| TelemuxError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_capacity == 0 {
            return Err(TelemuxError::config("session_capacity must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(TelemuxError::config("history_capacity must be at least 1"));
        }
        if self.keepalive_secs == 0 {
            return Err(TelemuxError::config("keepalive_secs must be at least 1"));
        }
        if self.session_idle_ttl_secs.is_some() && self.reaper_interval_secs == 0 {
            return Err(TelemuxError::config("reaper_interval_secs must be at least 1 when reaping is enabled"));
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn session_idle_ttl(&self) -> Option<Duration> {
        self.session_idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}
