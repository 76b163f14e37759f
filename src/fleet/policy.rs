//! Threshold scaling policies with self-scoped cooldown
//!
//! Each policy watches one metric aggregated across the group's active
//! instances. A policy that fires records its own trigger time and stays
//! quiet until its cooldown has elapsed; other policies are unaffected.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::instance::{Instance, MetricKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Greater,
    Less,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::Less => value < threshold,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::Greater => write!(f, ">"),
            Comparison::Less => write!(f, "<"),
        }
    }
}

/// A threshold rule mapping a metric value to a capacity delta
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub metric: MetricKind,
    pub threshold: f64,
    /// Instances added or removed when the policy fires
    pub adjustment: u32,
    pub comparison: Comparison,
    pub cooldown: Duration,
    last_triggered: Option<Duration>,
}

impl ScalingPolicy {
    pub fn new(
        metric: MetricKind,
        threshold: f64,
        adjustment: u32,
        comparison: Comparison,
        cooldown: Duration,
    ) -> Self {
        Self {
            metric,
            threshold,
            adjustment,
            comparison,
            cooldown,
            last_triggered: None,
        }
    }

    pub fn from_spec(spec: &PolicySpec) -> Self {
        let mut policy = Self::new(
            spec.metric,
            spec.threshold,
            spec.adjustment,
            spec.comparison,
            Duration::from_secs(spec.cooldown_secs),
        );
        policy.last_triggered = spec.last_triggered_ms.map(Duration::from_millis);
        policy
    }

    /// Time of the last firing on the group's clock
    pub fn last_triggered(&self) -> Option<Duration> {
        self.last_triggered
    }

    /// Whether the policy fires for `value` at time `now`.
    ///
    /// A threshold miss leaves the cooldown timer untouched.
    pub fn should_scale(&mut self, value: f64, now: Duration) -> bool {
        if let Some(last) = self.last_triggered {
            if now.saturating_sub(last) < self.cooldown {
                debug!(
                    metric = %self.metric,
                    remaining_ms = (self.cooldown - now.saturating_sub(last)).as_millis() as u64,
                    "Policy in cooldown"
                );
                return false;
            }
        }

        if self.comparison.holds(value, self.threshold) {
            self.last_triggered = Some(now);
            return true;
        }

        false
    }

    pub fn to_spec(&self) -> PolicySpec {
        PolicySpec {
            metric: self.metric,
            threshold: self.threshold,
            adjustment: self.adjustment,
            comparison: self.comparison,
            cooldown_secs: self.cooldown.as_secs(),
            last_triggered_ms: self.last_triggered.map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default = "default_metric")]
    pub metric: MetricKind,
    pub threshold: f64,
    #[serde(default = "default_adjustment")]
    pub adjustment: u32,
    pub comparison: Comparison,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_ms: Option<u64>,
}

fn default_metric() -> MetricKind {
    MetricKind::CpuUtilization
}

fn default_adjustment() -> u32 {
    1
}

fn default_cooldown_secs() -> u64 {
    300
}

// =============================================================================
// Aggregation
// =============================================================================

/// Mean of each metric across a set of instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub avg_cpu_utilization: f64,
    pub avg_memory_utilization: f64,
    pub avg_network_in: f64,
    pub avg_network_out: f64,
    pub instance_count: usize,
}

impl AggregateMetrics {
    pub fn value(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::CpuUtilization => self.avg_cpu_utilization,
            MetricKind::MemoryUtilization => self.avg_memory_utilization,
            MetricKind::NetworkIn => self.avg_network_in,
            MetricKind::NetworkOut => self.avg_network_out,
        }
    }
}

/// Average every metric over `instances`; all zero when there are none
pub fn aggregate_metrics(instances: &[Instance]) -> AggregateMetrics {
    if instances.is_empty() {
        return AggregateMetrics::default();
    }

    let n = instances.len() as f64;
    let mean = |kind: MetricKind| instances.iter().map(|i| i.metric(kind)).sum::<f64>() / n;

    AggregateMetrics {
        avg_cpu_utilization: mean(MetricKind::CpuUtilization),
        avg_memory_utilization: mean(MetricKind::MemoryUtilization),
        avg_network_in: mean(MetricKind::NetworkIn),
        avg_network_out: mean(MetricKind::NetworkOut),
        instance_count: instances.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn scale_out() -> ScalingPolicy {
        ScalingPolicy::new(
            MetricKind::CpuUtilization,
            70.0,
            1,
            Comparison::Greater,
            secs(60),
        )
    }

    #[test]
    fn test_cooldown_blocks_then_expires() {
        let mut policy = scale_out();
        assert!(policy.should_scale(85.0, secs(0)));
        assert_eq!(policy.last_triggered(), Some(secs(0)));

        assert!(!policy.should_scale(85.0, secs(30)));
        assert!(policy.should_scale(85.0, secs(61)));
        assert_eq!(policy.last_triggered(), Some(secs(61)));
    }

    #[test]
    fn test_threshold_miss_leaves_timer() {
        let mut policy = scale_out();
        assert!(!policy.should_scale(50.0, secs(10)));
        assert_eq!(policy.last_triggered(), None);

        assert!(policy.should_scale(71.0, secs(20)));
        assert!(!policy.should_scale(10.0, secs(100)));
        assert_eq!(policy.last_triggered(), Some(secs(20)));
    }

    #[test]
    fn test_less_comparison_is_strict() {
        let mut policy = ScalingPolicy::new(
            MetricKind::CpuUtilization,
            30.0,
            1,
            Comparison::Less,
            secs(300),
        );
        assert!(!policy.should_scale(30.0, secs(0)));
        assert!(policy.should_scale(29.9, secs(0)));
    }

    #[test]
    fn test_aggregate_empty_is_zero() {
        let agg = aggregate_metrics(&[]);
        assert_eq!(agg.value(MetricKind::CpuUtilization), 0.0);
        assert_eq!(agg.instance_count, 0);
    }

    #[test]
    fn test_aggregate_mean() {
        let mut a = Instance::new("a", "t2.micro", "ami");
        let mut b = Instance::new("b", "t2.micro", "ami");
        a.simulate_load(80.0);
        b.simulate_load(40.0);
        a.set_metric(MetricKind::NetworkIn, 10.0);
        let agg = aggregate_metrics(&[a, b]);
        assert_eq!(agg.avg_cpu_utilization, 60.0);
        assert_eq!(agg.avg_network_in, 5.0);
    }

    #[test]
    fn test_spec_preserves_trigger_time() {
        let mut policy = scale_out();
        policy.should_scale(90.0, Duration::from_millis(1500));
        let restored = ScalingPolicy::from_spec(&policy.to_spec());
        assert_eq!(restored.last_triggered(), Some(Duration::from_millis(1500)));
        assert_eq!(restored.cooldown, secs(60));
    }
}
