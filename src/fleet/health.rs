//! Consecutive-failure health checking
//!
//! The checker holds configuration only. The failure counter lives on the
//! instance, so one checker can serve any number of instances.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::instance::{HealthStatus, Instance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckType {
    #[default]
    Ec2,
    Elb,
}

/// Health-check configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub check_type: HealthCheckType,
    /// Carried for reporting; not enforced by [`HealthCheck::check_instance`]
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
    pub failure_threshold: u32,
    /// Cadence the caller should run checks at
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Ec2,
            grace_period: Duration::from_secs(300),
            failure_threshold: 2,
            interval: Duration::from_secs(60),
        }
    }
}

impl HealthCheck {
    /// Check one instance and update its health state.
    ///
    /// A running instance is healthy and its counter resets. Anything else
    /// counts as a failure; reaching `failure_threshold` marks it unhealthy.
    pub fn check_instance(&self, instance: &mut Instance) -> bool {
        if instance.is_running() {
            instance.health.consecutive_failed_checks = 0;
            instance.health.status = HealthStatus::Healthy;
            return true;
        }

        instance.health.consecutive_failed_checks += 1;
        debug!(
            instance = %instance.id(),
            failures = instance.health.consecutive_failed_checks,
            threshold = self.failure_threshold,
            "Health check failed"
        );

        if instance.health.consecutive_failed_checks >= self.failure_threshold
            && instance.health.status != HealthStatus::Unhealthy
        {
            instance.health.status = HealthStatus::Unhealthy;
            warn!(instance = %instance.id(), "Instance marked unhealthy");
        }

        false
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::RunState;

    #[test]
    fn test_defaults() {
        let hc = HealthCheck::default();
        assert_eq!(hc.check_type, HealthCheckType::Ec2);
        assert_eq!(hc.grace_period, Duration::from_secs(300));
        assert_eq!(hc.failure_threshold, 2);
        assert_eq!(hc.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_running_instance_is_healthy() {
        let hc = HealthCheck::default();
        let mut i = Instance::new("i-1", "t2.micro", "ami");
        i.start();
        i.health.consecutive_failed_checks = 1;
        assert!(hc.check_instance(&mut i));
        assert_eq!(i.health.consecutive_failed_checks, 0);
        assert!(i.is_healthy());
    }

    #[test]
    fn test_threshold_marks_unhealthy() {
        let hc = HealthCheck::default();
        let mut i = Instance::new("i-1", "t2.micro", "ami");
        i.force_state(RunState::Stopped);

        assert!(!hc.check_instance(&mut i));
        assert!(i.is_healthy());
        assert!(!hc.check_instance(&mut i));
        assert!(!i.is_healthy());
        assert_eq!(i.health.consecutive_failed_checks, 2);
    }

    #[test]
    fn test_recovery_resets_counter() {
        let hc = HealthCheck::default();
        let mut i = Instance::new("i-1", "t2.micro", "ami");
        hc.check_instance(&mut i);
        hc.check_instance(&mut i);
        assert!(!i.is_healthy());

        i.start();
        assert!(hc.check_instance(&mut i));
        assert!(i.is_healthy());
    }

    #[test]
    fn test_serde_uses_seconds() {
        let hc: HealthCheck =
            serde_json::from_str(r#"{"check_type": "ELB", "failure_threshold": 3}"#).unwrap();
        assert_eq!(hc.check_type, HealthCheckType::Elb);
        assert_eq!(hc.failure_threshold, 3);
        assert_eq!(hc.interval, Duration::from_secs(60));

        let json = serde_json::to_value(hc).unwrap();
        assert_eq!(json["grace_period"], 300);
    }
}
