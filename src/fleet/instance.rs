//! Managed compute instances
//!
//! An instance is a [`Resource`] with a run-state, a metrics component fed by
//! the metrics source, and a health component written by the health checker.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::network::{Resource, SecurityGroupAttachments, SharedSecurityGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
    /// Final. Only reached through [`Instance::shutdown`].
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Running => write!(f, "running"),
            RunState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Live utilization signals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub network_in: f64,
    pub network_out: f64,
}

impl InstanceMetrics {
    pub fn get(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::CpuUtilization => self.cpu_utilization,
            MetricKind::MemoryUtilization => self.memory_utilization,
            MetricKind::NetworkIn => self.network_in,
            MetricKind::NetworkOut => self.network_out,
        }
    }

    pub fn set(&mut self, kind: MetricKind, value: f64) {
        match kind {
            MetricKind::CpuUtilization => self.cpu_utilization = value,
            MetricKind::MemoryUtilization => self.memory_utilization = value,
            MetricKind::NetworkIn => self.network_in = value,
            MetricKind::NetworkOut => self.network_out = value,
        }
    }
}

/// Name of a metric a policy can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CpuUtilization,
    MemoryUtilization,
    NetworkIn,
    NetworkOut,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUtilization => "cpu_utilization",
            MetricKind::MemoryUtilization => "memory_utilization",
            MetricKind::NetworkIn => "network_in",
            MetricKind::NetworkOut => "network_out",
        }
    }

    /// Utilizations are percentages; network counters are non-negative
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            MetricKind::CpuUtilization | MetricKind::MemoryUtilization => {
                (0.0..=100.0).contains(&value)
            }
            MetricKind::NetworkIn | MetricKind::NetworkOut => value >= 0.0,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu_utilization" | "cpu" => Ok(MetricKind::CpuUtilization),
            "memory_utilization" | "memory" => Ok(MetricKind::MemoryUtilization),
            "network_in" => Ok(MetricKind::NetworkIn),
            "network_out" => Ok(MetricKind::NetworkOut),
            other => Err(format!("Unknown metric '{}'", other)),
        }
    }
}

/// Health bookkeeping owned by the instance, written by [`super::health::HealthCheck`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failed_checks: u32,
}

/// A compute instance
#[derive(Debug, Clone)]
pub struct Instance {
    id: String,
    instance_type: String,
    image_id: String,
    state: RunState,
    attachments: SecurityGroupAttachments,
    pub metrics: InstanceMetrics,
    pub health: HealthState,
}

impl Instance {
    /// A new instance starts stopped, healthy and idle
    pub fn new(
        id: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instance_type: instance_type.into(),
            image_id: image_id.into(),
            state: RunState::Stopped,
            attachments: SecurityGroupAttachments::new(),
            metrics: InstanceMetrics::default(),
            health: HealthState::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_type(&self) -> &str {
        &self.instance_type
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_healthy(&self) -> bool {
        self.health.status == HealthStatus::Healthy
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// No effect on a terminated instance
    pub fn start(&mut self) {
        if self.state == RunState::Terminated {
            debug!(instance = %self.id, "Ignoring start of terminated instance");
            return;
        }
        self.state = RunState::Running;
        info!(instance = %self.id, "Instance started");
    }

    /// No effect on a terminated instance
    pub fn stop(&mut self) {
        if self.state == RunState::Terminated {
            return;
        }
        self.state = RunState::Stopped;
        info!(instance = %self.id, "Instance stopped");
    }

    /// Terminate the instance. It cannot be started again.
    pub fn shutdown(&mut self) {
        self.state = RunState::Terminated;
        info!(instance = %self.id, "Instance terminated");
    }

    /// Force the run-state without lifecycle logging, for failure injection
    pub fn force_state(&mut self, state: RunState) {
        debug!(instance = %self.id, state = %state, "Forcing run-state");
        self.state = state;
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    pub fn metric(&self, kind: MetricKind) -> f64 {
        self.metrics.get(kind)
    }

    pub fn set_metric(&mut self, kind: MetricKind, value: f64) {
        self.metrics.set(kind, value);
    }

    /// Synthetic load: assigns CPU directly
    pub fn simulate_load(&mut self, cpu: f64) {
        self.metrics.cpu_utilization = cpu;
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            state: self.state,
            health: self.health.status,
            cpu_utilization: self.metrics.cpu_utilization,
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            instance_type: self.instance_type.clone(),
            image_id: self.image_id.clone(),
            state: self.state,
            security_groups: self.attachments.ids(),
            metrics: self.metrics,
            health: self.health,
        }
    }

    /// Rebuild from a record, resolving security group ids through `lookup`.
    ///
    /// Returns the id of the first group that cannot be resolved.
    pub fn from_record(
        record: &InstanceRecord,
        lookup: &HashMap<String, SharedSecurityGroup>,
    ) -> Result<Self, String> {
        let mut instance = Self::new(&record.id, &record.instance_type, &record.image_id);
        for id in &record.security_groups {
            let group = lookup.get(id).cloned().ok_or_else(|| id.clone())?;
            instance.attachments.attach(group);
        }
        instance.state = record.state;
        instance.metrics = record.metrics;
        instance.health = record.health;
        Ok(instance)
    }
}

impl Resource for Instance {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn attachments(&self) -> &SecurityGroupAttachments {
        &self.attachments
    }

    fn attachments_mut(&mut self) -> &mut SecurityGroupAttachments {
        &mut self.attachments
    }
}

/// Per-instance line of a group status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub state: RunState,
    pub health: HealthStatus,
    pub cpu_utilization: f64,
}

/// Persisted form of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub instance_type: String,
    pub image_id: String,
    pub state: RunState,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub metrics: InstanceMetrics,
    #[serde(default)]
    pub health: HealthState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Protocol, SecurityGroup, Traffic};

    #[test]
    fn test_lifecycle() {
        let mut i = Instance::new("i-1", "t2.micro", "ami-12345");
        assert_eq!(i.state(), RunState::Stopped);
        i.start();
        assert!(i.is_running());
        i.stop();
        assert_eq!(i.state(), RunState::Stopped);
        i.shutdown();
        i.start();
        assert_eq!(i.state(), RunState::Terminated);
    }

    #[test]
    fn test_metrics_default_to_zero() {
        let mut i = Instance::new("i-1", "t2.micro", "ami-12345");
        assert_eq!(i.metric(MetricKind::CpuUtilization), 0.0);
        assert_eq!(i.metric(MetricKind::NetworkOut), 0.0);
        i.simulate_load(42.5);
        i.set_metric(MetricKind::MemoryUtilization, 60.0);
        assert_eq!(i.metric(MetricKind::CpuUtilization), 42.5);
        assert_eq!(i.metric(MetricKind::MemoryUtilization), 60.0);
        assert_eq!(i.summary().cpu_utilization, 42.5);
    }

    #[test]
    fn test_metric_kind_parsing() {
        assert_eq!(
            "cpu_utilization".parse::<MetricKind>().unwrap(),
            MetricKind::CpuUtilization
        );
        assert!("disk".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_metric_value_ranges() {
        assert!(MetricKind::CpuUtilization.accepts(0.0));
        assert!(MetricKind::CpuUtilization.accepts(100.0));
        assert!(!MetricKind::CpuUtilization.accepts(-1.0));
        assert!(!MetricKind::MemoryUtilization.accepts(100.5));
        assert!(!MetricKind::CpuUtilization.accepts(f64::NAN));
        assert!(MetricKind::NetworkIn.accepts(1.0e9));
        assert!(!MetricKind::NetworkOut.accepts(-0.5));
        assert!(!MetricKind::NetworkOut.accepts(f64::INFINITY));
    }

    #[test]
    fn test_instance_is_a_resource() {
        let sg = SecurityGroup::shared("sg-web", "web", "");
        sg.add_ingress_rule(Protocol::Tcp, 443, 443, "0.0.0.0/0")
            .unwrap();
        let mut i = Instance::new("i-1", "t2.micro", "ami-12345");

        let t = Traffic::parse("198.51.100.4", "10.0.0.5", Protocol::Tcp, 443).unwrap();
        assert!(!i.can_receive_traffic(&t));
        i.attach_security_group(sg);
        assert!(i.can_receive_traffic(&t));
    }

    #[test]
    fn test_record_round_trip() {
        let sg = SecurityGroup::shared("sg-web", "web", "");
        let mut i = Instance::new("i-1", "t2.micro", "ami-12345");
        i.attach_security_group(sg.clone());
        i.start();
        i.simulate_load(70.0);

        let mut lookup = HashMap::new();
        lookup.insert("sg-web".to_string(), sg);
        let rebuilt = Instance::from_record(&i.to_record(), &lookup).unwrap();
        assert_eq!(rebuilt.to_record(), i.to_record());

        let missing = Instance::from_record(&i.to_record(), &HashMap::new());
        assert_eq!(missing.unwrap_err(), "sg-web");
    }
}
