// Route and fleet configuration consumed by the booking core

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

// Everything an external loader hands to the core.
// Missing fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub route_id: String,
    pub seats_per_bus: u16,
    pub initial_fleet_size: usize,
    pub min_fleet_size: usize,
    pub max_fleet_size: usize,
    pub high_threshold: f64,
    pub low_threshold: f64,
    // Number of sample intervals the auto-scaler ignores after acting
    pub cooldown_samples: u32,
    pub sampler_period_ms: u64,
    // Load samples kept for the rolling report
    pub sample_history: usize,
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
    pub hold_timeout_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            route_id: "Nakuru-Nairobi".to_string(),
            seats_per_bus: 50,
            initial_fleet_size: 10,
            min_fleet_size: 1,
            max_fleet_size: 100,
            high_threshold: 0.85,
            low_threshold: 0.25,
            cooldown_samples: 3,
            sampler_period_ms: 2000,
            sample_history: 60,
            worker_pool_size: 10,
            queue_capacity: 1000,
            hold_timeout_secs: 300,
        }
    }
}

impl SystemConfig {
    pub fn sampler_period(&self) -> Duration {
        Duration::from_millis(self.sampler_period_ms)
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }

    // Collects every problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.route_id.trim().is_empty() {
            errors.push("route_id must not be empty".to_string());
        }
        if self.seats_per_bus == 0 {
            errors.push("seats_per_bus must be positive".to_string());
        }
        if self.initial_fleet_size == 0 {
            errors.push("initial_fleet_size must be positive".to_string());
        }
        if self.min_fleet_size > self.initial_fleet_size {
            errors.push("min_fleet_size must be <= initial_fleet_size".to_string());
        }
        if self.max_fleet_size < self.initial_fleet_size {
            errors.push("max_fleet_size must be >= initial_fleet_size".to_string());
        }
        if !(0.0 <= self.low_threshold
            && self.low_threshold < self.high_threshold
            && self.high_threshold <= 1.0)
        {
            errors.push(format!(
                "thresholds must satisfy 0 <= low < high <= 1 (low={}, high={})",
                self.low_threshold, self.high_threshold
            ));
        }
        if self.sampler_period_ms == 0 {
            errors.push("sampler_period_ms must be positive".to_string());
        }
        if self.sample_history == 0 {
            errors.push("sample_history must be positive".to_string());
        }
        if self.worker_pool_size == 0 {
            errors.push("worker_pool_size must be positive".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be positive".to_string());
        }
        if self.hold_timeout_secs == 0 {
            errors.push("hold_timeout_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
