//! Auto-scaling group: the capacity state machine
//!
//! A group moves `not_started -> running -> stopped` and never restarts.
//! Every mutation keeps `min_size <= active instances <= max_size`; an
//! add at `max_size` or a remove at `min_size` is refused and changes nothing.
//!
//! `desired_capacity` follows the active count after every scaling path.
//! Manual `set_desired_capacity` converges the group onto the requested value.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{MonotonicClock, SharedClock};
use super::health::HealthCheck;
use super::instance::{Instance, InstanceRecord, InstanceSummary, MetricKind};
use super::policy::{aggregate_metrics, AggregateMetrics, PolicySpec, ScalingPolicy};
use super::template::{LaunchTemplate, TemplateSpec};
use super::warm_pool::{WarmPool, WarmPoolRecord, WarmPoolStatus};
use crate::network::SharedSecurityGroup;

/// Errors raised by group operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GroupError {
    #[error("Already at maximum capacity: {0}")]
    AtMaxCapacity(usize),

    #[error("Already at minimum capacity: {0}")]
    AtMinCapacity(usize),

    #[error("Invalid bounds: min {min}, desired {desired}, max {max}")]
    InvalidBounds {
        min: usize,
        desired: usize,
        max: usize,
    },

    #[error("Capacity must be between {min} and {max}, got {capacity}")]
    CapacityOutOfBounds {
        capacity: usize,
        min: usize,
        max: usize,
    },

    #[error("Group '{0}' is not running")]
    NotRunning(String),

    #[error("Group '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("Unknown security group '{0}'")]
    UnknownSecurityGroup(String),

    #[error("Invalid {metric} value: {value}")]
    InvalidMetric { metric: MetricKind, value: f64 },
}

impl GroupError {
    /// Capacity bound violations are reported as failed results, not errors
    pub fn is_capacity_bound(&self) -> bool {
        matches!(
            self,
            GroupError::AtMaxCapacity(_) | GroupError::AtMinCapacity(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::NotStarted => write!(f, "not_started"),
            GroupState::Running => write!(f, "running"),
            GroupState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What one `evaluate_metrics` pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingActivity {
    pub aggregate: AggregateMetrics,
    pub policies_fired: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ScalingActivity {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// An unhealthy instance swapped out by `check_health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    pub removed: String,
    pub added: Option<String>,
}

/// Result of a manual capacity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityChange {
    pub previous: usize,
    pub new: usize,
}

/// What one `reconcile` pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub activity: ScalingActivity,
    pub health_checked: bool,
    pub replacements: Vec<Replacement>,
    pub warm_instances_created: usize,
}

/// The auto-scaling group
#[derive(Debug)]
pub struct AutoScalingGroup {
    name: String,
    template: LaunchTemplate,
    min_size: usize,
    max_size: usize,
    desired_capacity: usize,
    instances: Vec<Instance>,
    scale_out_policies: Vec<ScalingPolicy>,
    scale_in_policies: Vec<ScalingPolicy>,
    health_check: HealthCheck,
    warm_pool: Option<WarmPool>,
    state: GroupState,
    clock: SharedClock,
    started_at: Option<Duration>,
    last_health_check: Option<Duration>,
}

impl AutoScalingGroup {
    pub fn new(
        name: impl Into<String>,
        template: LaunchTemplate,
        min_size: usize,
        max_size: usize,
        desired_capacity: usize,
    ) -> Result<Self, GroupError> {
        if min_size > desired_capacity || desired_capacity > max_size {
            return Err(GroupError::InvalidBounds {
                min: min_size,
                desired: desired_capacity,
                max: max_size,
            });
        }

        Ok(Self {
            name: name.into(),
            template,
            min_size,
            max_size,
            desired_capacity,
            instances: Vec::new(),
            scale_out_policies: Vec::new(),
            scale_in_policies: Vec::new(),
            health_check: HealthCheck::default(),
            warm_pool: None,
            state: GroupState::NotStarted,
            clock: MonotonicClock::shared(),
            started_at: None,
            last_health_check: None,
        })
    }

    pub fn with_warm_pool(mut self, pool: WarmPool) -> Self {
        self.warm_pool = Some(pool);
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_scale_out_policy(&mut self, policy: ScalingPolicy) {
        self.scale_out_policies.push(policy);
    }

    pub fn add_scale_in_policy(&mut self, policy: ScalingPolicy) {
        self.scale_in_policies.push(policy);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &LaunchTemplate {
        &self.template
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn desired_capacity(&self) -> usize {
        self.desired_capacity
    }

    pub fn current_size(&self) -> usize {
        self.instances.len()
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id() == id)
    }

    pub fn warm_pool(&self) -> Option<&WarmPool> {
        self.warm_pool.as_ref()
    }

    pub fn health_check(&self) -> &HealthCheck {
        &self.health_check
    }

    pub fn scale_out_policies(&self) -> &[ScalingPolicy] {
        &self.scale_out_policies
    }

    pub fn scale_in_policies(&self) -> &[ScalingPolicy] {
        &self.scale_in_policies
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Fill the warm pool, then bring the group up to `desired_capacity`
    pub fn start(&mut self) -> Result<(), GroupError> {
        if self.state != GroupState::NotStarted {
            return Err(GroupError::AlreadyStarted(self.name.clone()));
        }

        if let Some(pool) = self.warm_pool.as_mut() {
            pool.initialize(&self.template, &self.name);
        }

        let target = self.desired_capacity;
        while self.instances.len() < target {
            if let Err(e) = self.add_instance() {
                warn!(group = %self.name, error = %e, "Could not reach desired capacity");
                break;
            }
        }

        self.state = GroupState::Running;
        self.started_at = Some(self.clock.now());
        info!(
            group = %self.name,
            instances = self.instances.len(),
            "Auto-scaling group started"
        );
        Ok(())
    }

    /// Stop every active instance and the warm pool. Final.
    pub fn stop(&mut self) {
        for instance in &mut self.instances {
            instance.stop();
        }
        self.instances.clear();

        if let Some(pool) = self.warm_pool.as_mut() {
            pool.stop();
        }

        self.state = GroupState::Stopped;
        info!(group = %self.name, "Auto-scaling group stopped");
    }

    fn ensure_running(&self) -> Result<(), GroupError> {
        if self.state != GroupState::Running {
            return Err(GroupError::NotRunning(self.name.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Instance Management
    // =========================================================================

    /// Bring one more instance into service, preferring the warm pool
    pub fn add_instance(&mut self) -> Result<String, GroupError> {
        if self.state == GroupState::Stopped {
            return Err(GroupError::NotRunning(self.name.clone()));
        }
        if self.instances.len() >= self.max_size {
            debug!(group = %self.name, max = self.max_size, "Cannot add instance");
            return Err(GroupError::AtMaxCapacity(self.max_size));
        }

        let warm = self
            .warm_pool
            .as_mut()
            .and_then(|pool| pool.get_instances(1).pop());

        let instance = match warm {
            Some(instance) => {
                info!(group = %self.name, instance = %instance.id(), "Added warm instance");
                instance
            }
            None => {
                let mut instance = self.template.create_instance(self.next_instance_id());
                instance.start();
                info!(group = %self.name, instance = %instance.id(), "Launched new instance");
                instance
            }
        };

        let id = instance.id().to_string();
        self.instances.push(instance);
        self.desired_capacity = self.instances.len();
        Ok(id)
    }

    /// Take the least-loaded instance out of service
    pub fn remove_instance(&mut self) -> Result<String, GroupError> {
        if self.instances.len() <= self.min_size {
            debug!(group = %self.name, min = self.min_size, "Cannot remove instance");
            return Err(GroupError::AtMinCapacity(self.min_size));
        }

        let index = self.lowest_cpu_index();
        let instance = self.instances.remove(index);
        let id = instance.id().to_string();
        self.retire(instance);
        self.desired_capacity = self.instances.len();
        Ok(id)
    }

    /// First instance with the minimum CPU
    fn lowest_cpu_index(&self) -> usize {
        let mut best = 0;
        for (i, instance) in self.instances.iter().enumerate().skip(1) {
            if instance.metrics.cpu_utilization < self.instances[best].metrics.cpu_utilization {
                best = i;
            }
        }
        best
    }

    /// Recycle into the warm pool if it has room, otherwise stop
    fn retire(&mut self, mut instance: Instance) {
        match self.warm_pool.as_mut() {
            Some(pool) if pool.has_capacity() => {
                info!(group = %self.name, instance = %instance.id(), "Moved instance to warm pool");
                for mut rejected in pool.add_instances(vec![instance]) {
                    rejected.shutdown();
                }
            }
            _ => {
                instance.stop();
                info!(group = %self.name, instance = %instance.id(), "Removed instance");
            }
        }
    }

    /// `{group}-instance-{n+1}`, moving past any id already in use
    fn next_instance_id(&self) -> String {
        let mut n = self.instances.len() + 1;
        loop {
            let id = format!("{}-instance-{}", self.name, n);
            if !self.id_in_use(&id) {
                return id;
            }
            n += 1;
        }
    }

    fn id_in_use(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id() == id)
            || self
                .warm_pool
                .as_ref()
                .is_some_and(|pool| pool.instance_ids().any(|w| w == id))
    }

    // =========================================================================
    // Metrics and Scaling
    // =========================================================================

    /// Synthetic load: CPU of every active instance set to `load`
    pub fn simulate_traffic(&mut self, load: f64) -> Result<(), GroupError> {
        self.ensure_running()?;
        check_metric(MetricKind::CpuUtilization, load)?;
        for instance in &mut self.instances {
            instance.simulate_load(load);
        }
        debug!(group = %self.name, load, "Applied synthetic load");
        Ok(())
    }

    /// Apply metric samples keyed by instance id. Unknown ids are ignored.
    ///
    /// Nothing is applied unless every sample is in range for `kind`.
    pub fn record_metric(
        &mut self,
        kind: MetricKind,
        samples: &HashMap<String, f64>,
    ) -> Result<usize, GroupError> {
        self.ensure_running()?;
        for value in samples.values() {
            check_metric(kind, *value)?;
        }

        let mut applied = 0;
        for instance in &mut self.instances {
            if let Some(value) = samples.get(instance.id()) {
                instance.set_metric(kind, *value);
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub fn aggregate(&self) -> AggregateMetrics {
        aggregate_metrics(&self.instances)
    }

    /// Run every scale-out policy, then every scale-in policy, against one aggregate
    pub fn evaluate_metrics(&mut self) -> Result<ScalingActivity, GroupError> {
        self.ensure_running()?;
        Ok(self.apply_policies())
    }

    fn apply_policies(&mut self) -> ScalingActivity {
        let now = self.clock.now();
        let aggregate = self.aggregate();
        let mut activity = ScalingActivity {
            aggregate,
            ..Default::default()
        };

        for idx in 0..self.scale_out_policies.len() {
            let policy = &mut self.scale_out_policies[idx];
            let value = aggregate.value(policy.metric);
            if !policy.should_scale(value, now) {
                continue;
            }

            let adjustment = policy.adjustment;
            info!(
                group = %self.name,
                metric = %policy.metric,
                value,
                threshold = policy.threshold,
                adjustment,
                "Scale-out policy fired"
            );
            activity.policies_fired += 1;

            for _ in 0..adjustment {
                match self.add_instance() {
                    Ok(id) => activity.added.push(id),
                    Err(_) => break,
                }
            }
        }

        for idx in 0..self.scale_in_policies.len() {
            let policy = &mut self.scale_in_policies[idx];
            let value = aggregate.value(policy.metric);
            if !policy.should_scale(value, now) {
                continue;
            }

            let adjustment = policy.adjustment;
            info!(
                group = %self.name,
                metric = %policy.metric,
                value,
                threshold = policy.threshold,
                adjustment,
                "Scale-in policy fired"
            );
            activity.policies_fired += 1;

            for _ in 0..adjustment {
                match self.remove_instance() {
                    Ok(id) => activity.removed.push(id),
                    Err(_) => break,
                }
            }
        }

        activity
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Check every active instance; each failure is replaced immediately.
    pub fn check_health(&mut self) -> Result<Vec<Replacement>, GroupError> {
        self.ensure_running()?;
        Ok(self.replace_unhealthy())
    }

    /// Iterates over a snapshot of ids taken before any replacement
    fn replace_unhealthy(&mut self) -> Vec<Replacement> {
        let ids: Vec<String> = self.instances.iter().map(|i| i.id().to_string()).collect();
        let mut replacements = Vec::new();

        for id in ids {
            let Some(index) = self.instances.iter().position(|i| i.id() == id) else {
                continue;
            };

            if self.health_check.check_instance(&mut self.instances[index]) {
                continue;
            }

            warn!(group = %self.name, instance = %id, "Instance is unhealthy and will be replaced");
            replacements.push(self.replace_instance(index));
        }

        replacements
    }

    /// Swap out the instance at `index`. The active count is unchanged.
    fn replace_instance(&mut self, index: usize) -> Replacement {
        let mut failed = self.instances.remove(index);
        failed.shutdown();
        let removed = failed.id().to_string();

        let added = match self.add_instance() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(group = %self.name, error = %e, "Replacement launch failed");
                None
            }
        };

        Replacement { removed, added }
    }

    /// One control-loop pass: scale, health-check when due, refill the warm pool
    pub fn reconcile(&mut self) -> ReconcileOutcome {
        if self.state != GroupState::Running {
            return ReconcileOutcome::default();
        }

        let mut outcome = ReconcileOutcome {
            activity: self.apply_policies(),
            ..Default::default()
        };

        let now = self.clock.now();
        if self.health_check_due(now) {
            self.last_health_check = Some(now);
            outcome.health_checked = true;
            outcome.replacements = self.replace_unhealthy();
        }

        if let Some(pool) = self.warm_pool.as_mut() {
            if pool.below_minimum() {
                outcome.warm_instances_created = pool.maintain_size(&self.template, &self.name);
            }
        }

        outcome
    }

    /// Past the grace period and at least one interval since the last check
    fn health_check_due(&self, now: Duration) -> bool {
        let Some(started) = self.started_at else {
            return false;
        };
        if now.saturating_sub(started) < self.health_check.grace_period {
            return false;
        }
        match self.last_health_check {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.health_check.interval,
        }
    }

    // =========================================================================
    // Manual Scaling
    // =========================================================================

    pub fn scale_out(&mut self) -> Result<CapacityChange, GroupError> {
        self.ensure_running()?;
        let previous = self.instances.len();
        self.add_instance()?;
        Ok(CapacityChange {
            previous,
            new: self.instances.len(),
        })
    }

    pub fn scale_in(&mut self) -> Result<CapacityChange, GroupError> {
        self.ensure_running()?;
        let previous = self.instances.len();
        self.remove_instance()?;
        Ok(CapacityChange {
            previous,
            new: self.instances.len(),
        })
    }

    /// Add or remove instances until the group has exactly `capacity`
    pub fn set_desired_capacity(&mut self, capacity: usize) -> Result<CapacityChange, GroupError> {
        self.ensure_running()?;
        if capacity < self.min_size || capacity > self.max_size {
            return Err(GroupError::CapacityOutOfBounds {
                capacity,
                min: self.min_size,
                max: self.max_size,
            });
        }

        let previous = self.instances.len();
        while self.instances.len() < capacity {
            self.add_instance()?;
        }
        while self.instances.len() > capacity {
            self.remove_instance()?;
        }
        self.desired_capacity = capacity;

        info!(group = %self.name, previous, capacity, "Desired capacity set");
        Ok(CapacityChange {
            previous,
            new: self.instances.len(),
        })
    }

    // =========================================================================
    // Status and Persistence
    // =========================================================================

    pub fn get_status(&self) -> GroupStatus {
        GroupStatus {
            name: self.name.clone(),
            state: self.state,
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            current_size: self.instances.len(),
            instances: self.instances.iter().map(Instance::summary).collect(),
            warm_pool: self.warm_pool.as_ref().map(WarmPool::status),
        }
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            state: self.state,
            template: self.template.to_spec(),
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            health_check: self.health_check,
            scale_out_policies: self.scale_out_policies.iter().map(ScalingPolicy::to_spec).collect(),
            scale_in_policies: self.scale_in_policies.iter().map(ScalingPolicy::to_spec).collect(),
            instances: self.instances.iter().map(Instance::to_record).collect(),
            warm_pool: self.warm_pool.as_ref().map(WarmPool::to_record),
        }
    }

    /// Rebuild a group from a snapshot.
    ///
    /// Cooldown and health-check timers are relative to the clock that took
    /// the snapshot, so they start fresh on `clock`.
    pub fn restore(
        snapshot: &GroupSnapshot,
        lookup: &HashMap<String, SharedSecurityGroup>,
        clock: SharedClock,
    ) -> Result<Self, GroupError> {
        let template =
            LaunchTemplate::from_spec(&snapshot.template, lookup).map_err(GroupError::UnknownSecurityGroup)?;

        let mut group = Self::new(
            &snapshot.name,
            template,
            snapshot.min_size,
            snapshot.max_size,
            snapshot
                .desired_capacity
                .max(snapshot.min_size)
                .min(snapshot.max_size),
        )?
        .with_health_check(snapshot.health_check)
        .with_clock(clock);

        let fresh_policy = |spec: &PolicySpec| {
            ScalingPolicy::from_spec(&PolicySpec {
                last_triggered_ms: None,
                ..spec.clone()
            })
        };
        group.scale_out_policies = snapshot.scale_out_policies.iter().map(fresh_policy).collect();
        group.scale_in_policies = snapshot.scale_in_policies.iter().map(fresh_policy).collect();

        group.instances = snapshot
            .instances
            .iter()
            .map(|r| Instance::from_record(r, lookup))
            .collect::<Result<_, _>>()
            .map_err(GroupError::UnknownSecurityGroup)?;

        group.warm_pool = snapshot
            .warm_pool
            .as_ref()
            .map(|r| WarmPool::from_record(r, lookup))
            .transpose()
            .map_err(GroupError::UnknownSecurityGroup)?;

        group.desired_capacity = snapshot.desired_capacity;
        group.state = snapshot.state;
        if group.state == GroupState::Running {
            group.started_at = Some(group.clock.now());
        }

        Ok(group)
    }
}

fn check_metric(metric: MetricKind, value: f64) -> Result<(), GroupError> {
    if metric.accepts(value) {
        Ok(())
    } else {
        Err(GroupError::InvalidMetric { metric, value })
    }
}

/// Deterministic status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub state: GroupState,
    pub min_size: usize,
    pub max_size: usize,
    pub desired_capacity: usize,
    pub current_size: usize,
    pub instances: Vec<InstanceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPoolStatus>,
}

/// Persisted form of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub state: GroupState,
    pub template: TemplateSpec,
    pub min_size: usize,
    pub max_size: usize,
    pub desired_capacity: usize,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub scale_out_policies: Vec<PolicySpec>,
    #[serde(default)]
    pub scale_in_policies: Vec<PolicySpec>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPoolRecord>,
}
