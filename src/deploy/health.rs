//! Health sampling and the ceilings that decide a breach.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CollaboratorError, ConfigError};
use crate::model::HealthStatus;

/// Raw measurement returned by a [`HealthProbe`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthSample {
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub user_feedback: Option<f64>,
    /// Users served by the change since the last sample.
    pub affected_users: u64,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Measure the code serving `evolution_id` while it receives `percentage`
    /// of traffic.
    async fn sample(&self, evolution_id: &str, percentage: u8) -> Result<HealthSample, CollaboratorError>;
}

/// A rollout is healthy while both observations stay strictly below their
/// ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub max_error_rate: f64,
    pub max_response_time_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { max_error_rate: 0.05, max_response_time_ms: 500.0 }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_error_rate > 0.0 && self.max_error_rate <= 1.0) {
            return Err(ConfigError::invalid("health.max_error_rate", "must be in (0, 1]"));
        }
        if !(self.max_response_time_ms.is_finite() && self.max_response_time_ms > 0.0) {
            return Err(ConfigError::invalid("health.max_response_time_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Why `error_rate`/`response_time_ms` breach the ceilings, if they do.
    pub fn breach_reason(&self, error_rate: f64, response_time_ms: f64) -> Option<String> {
        if !(error_rate < self.max_error_rate) {
            return Some(format!("error rate {:.3} >= {:.3}", error_rate, self.max_error_rate));
        }
        if !(response_time_ms < self.max_response_time_ms) {
            return Some(format!(
                "response time {:.0} ms >= {:.0} ms",
                response_time_ms, self.max_response_time_ms
            ));
        }
        None
    }

    pub fn assess(&self, sample: &HealthSample) -> HealthStatus {
        HealthStatus {
            healthy: self.breach_reason(sample.error_rate, sample.response_time_ms).is_none(),
            error_rate: sample.error_rate,
            response_time_ms: sample.response_time_ms,
            cpu_usage: sample.cpu_usage,
            mem_usage: sample.mem_usage,
            user_feedback: sample.user_feedback,
        }
    }
}
