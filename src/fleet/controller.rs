//! Fleet Controller - owns every group and security group
//!
//! Each group sits behind its own mutex. The reconciler and the management
//! API take the same lock for one synchronous pass at a time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::SharedClock;
use super::group::{AutoScalingGroup, GroupError, GroupState, GroupStatus, ReconcileOutcome, Replacement, ScalingActivity};
use super::instance::MetricKind;
use super::policy::ScalingPolicy;
use super::template::LaunchTemplate;
use crate::config::{Manifest, ValidationTargets};
use crate::network::{
    audit_traffic, FlowCheck, FlowDecision, GroupType, OpenPorts, Resource, RuleError,
    SecurityGroup, SecurityGroupAttachments, SecurityGroupSummary, SharedSecurityGroup,
};
use crate::store::FleetSnapshot;

/// Errors that can occur in the fleet controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Group '{0}' already exists")]
    GroupExists(String),

    #[error("Security group '{0}' not found")]
    SecurityGroupNotFound(String),

    #[error("Security group '{0}' already exists")]
    SecurityGroupExists(String),

    #[error("Launch template '{0}' not found")]
    TemplateNotFound(String),

    #[error("No security group configured for {0} validation")]
    NoValidationTarget(GroupType),

    #[error("Invalid scaling request: {0}")]
    InvalidScalingRequest(String),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl ControllerError {
    /// Unknown group, security group, template or validation target
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GroupNotFound(_)
                | Self::SecurityGroupNotFound(_)
                | Self::TemplateNotFound(_)
                | Self::NoValidationTarget(_)
        )
    }
}

pub type SharedGroup = Arc<Mutex<AutoScalingGroup>>;

// ============================================================================
// Requests and Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    ScaleOut,
    ScaleIn,
    SetCapacity,
}

impl std::str::FromStr for ScalingAction {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale_out" => Ok(Self::ScaleOut),
            "scale_in" => Ok(Self::ScaleIn),
            "set_capacity" => Ok(Self::SetCapacity),
            other => Err(ControllerError::InvalidScalingRequest(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

/// Manual scaling request. `action` is kept as a string so an unknown
/// action is reported as a bad request rather than a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl ScalingRequest {
    pub fn new(action: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            action: action.into(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingResponse {
    pub previous_capacity: usize,
    pub new_capacity: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub group_id: String,
    pub group_type: GroupType,
    pub open_ports: OpenPorts,
    pub is_correctly_configured: bool,
}

/// Fleet-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStats {
    pub groups: usize,
    pub running_groups: usize,
    pub active_instances: usize,
    pub warm_instances: usize,
    pub security_groups: usize,
}

/// Stand-in resource carrying exactly one security group, for audits
struct AuthorizationTarget {
    id: String,
    attachments: SecurityGroupAttachments,
}

impl Resource for AuthorizationTarget {
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

// ============================================================================
// Controller
// ============================================================================

#[derive(Clone)]
pub struct FleetController {
    /// Groups indexed by name
    groups: Arc<DashMap<String, SharedGroup>>,

    /// Security groups indexed by id
    security_groups: Arc<DashMap<String, SharedSecurityGroup>>,

    validation: Arc<RwLock<ValidationTargets>>,

    clock: SharedClock,
}

impl FleetController {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            security_groups: Arc::new(DashMap::new()),
            validation: Arc::new(RwLock::new(ValidationTargets::default())),
            clock,
        }
    }

    /// Build every security group, template and group the manifest names.
    /// Groups are created but not started.
    pub fn from_manifest(manifest: &Manifest, clock: SharedClock) -> Result<Self, ControllerError> {
        let controller = Self::new(clock);

        for spec in &manifest.security_groups {
            controller.add_security_group(SecurityGroup::from_spec(spec)?.into())?;
        }
        let lookup = controller.security_group_lookup();

        let mut templates = HashMap::new();
        for spec in &manifest.templates {
            let template = LaunchTemplate::from_spec(spec, &lookup)
                .map_err(ControllerError::SecurityGroupNotFound)?;
            templates.insert(spec.id.clone(), template);
        }

        for spec in &manifest.groups {
            let template = templates
                .get(&spec.template)
                .cloned()
                .ok_or_else(|| ControllerError::TemplateNotFound(spec.template.clone()))?;

            let mut group = AutoScalingGroup::new(
                &spec.name,
                template,
                spec.min_size,
                spec.max_size,
                spec.desired_capacity,
            )?
            .with_health_check(spec.health_check)
            .with_clock(controller.clock.clone());

            if let Some(pool) = &spec.warm_pool {
                group = group.with_warm_pool(pool.build());
            }
            for policy in &spec.scale_out_policies {
                group.add_scale_out_policy(ScalingPolicy::from_spec(policy));
            }
            for policy in &spec.scale_in_policies {
                group.add_scale_in_policy(ScalingPolicy::from_spec(policy));
            }

            controller.add_group(group)?;
        }

        controller.set_validation_targets(manifest.validation.clone());
        info!(
            groups = controller.groups.len(),
            security_groups = controller.security_groups.len(),
            "Fleet built from manifest"
        );
        Ok(controller)
    }

    /// Rebuild from saved state. Groups keep the run state they were saved in.
    pub fn restore(snapshot: &FleetSnapshot, clock: SharedClock) -> Result<Self, ControllerError> {
        let controller = Self::new(clock);

        for spec in &snapshot.security_groups {
            controller.add_security_group(SecurityGroup::from_spec(spec)?.into())?;
        }
        let lookup = controller.security_group_lookup();

        for group in &snapshot.groups {
            let restored = AutoScalingGroup::restore(group, &lookup, controller.clock.clone())?;
            controller.add_group(restored)?;
        }

        controller.set_validation_targets(snapshot.validation.clone());
        info!(
            groups = controller.groups.len(),
            saved_at = %snapshot.saved_at,
            "Fleet restored from state"
        );
        Ok(controller)
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let mut security_groups: Vec<_> = self.security_groups.iter().map(|r| r.to_spec()).collect();
        security_groups.sort_by(|a, b| a.id.cmp(&b.id));

        let mut groups: Vec<_> = self.group_handles().iter().map(|g| g.lock().snapshot()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        FleetSnapshot {
            saved_at: Utc::now(),
            security_groups,
            groups,
            validation: self.validation.read().clone(),
        }
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    // =========================================================================
    // Security Groups
    // =========================================================================

    pub fn add_security_group(&self, group: SharedSecurityGroup) -> Result<(), ControllerError> {
        let id = group.id().to_string();
        if self.security_groups.contains_key(&id) {
            return Err(ControllerError::SecurityGroupExists(id));
        }
        self.security_groups.insert(id, group);
        Ok(())
    }

    pub fn get_security_group(&self, id: &str) -> Option<SharedSecurityGroup> {
        self.security_groups.get(id).map(|r| r.clone())
    }

    /// Summaries sorted by id
    pub fn list_security_groups(&self) -> Vec<SecurityGroupSummary> {
        let mut list: Vec<_> = self.security_groups.iter().map(|r| r.summary()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn security_group_lookup(&self) -> HashMap<String, SharedSecurityGroup> {
        self.security_groups
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn set_validation_targets(&self, targets: ValidationTargets) {
        *self.validation.write() = targets;
    }

    pub fn validation_targets(&self) -> ValidationTargets {
        self.validation.read().clone()
    }

    /// Report the configured group for `group_type` and whether its open
    /// ports match the expectation for that type
    pub fn validate_security_group(&self, group_type: GroupType) -> Result<ValidationReport, ControllerError> {
        let id = self
            .validation
            .read()
            .get(group_type)
            .map(str::to_string)
            .ok_or(ControllerError::NoValidationTarget(group_type))?;
        let group = self
            .get_security_group(&id)
            .ok_or_else(|| ControllerError::SecurityGroupNotFound(id.clone()))?;

        let open_ports = group.open_ports();
        let is_correctly_configured = group_type.is_satisfied_by(&open_ports);
        if !is_correctly_configured {
            warn!(group = %id, %group_type, %open_ports, "Security group is misconfigured");
        }

        Ok(ValidationReport {
            group_id: id,
            group_type,
            open_ports,
            is_correctly_configured,
        })
    }

    /// Evaluate flows as if the security group were the only one attached
    pub fn authorize(&self, group_id: &str, checks: &[FlowCheck]) -> Result<Vec<FlowDecision>, ControllerError> {
        let group = self
            .get_security_group(group_id)
            .ok_or_else(|| ControllerError::SecurityGroupNotFound(group_id.to_string()))?;

        let target = AuthorizationTarget {
            id: format!("authorize-{}", group_id),
            attachments: SecurityGroupAttachments::from_groups(vec![group]),
        };
        let decisions = audit_traffic(&target, checks);
        debug!(
            group = %group_id,
            flows = decisions.len(),
            allowed = decisions.iter().filter(|d| d.allowed).count(),
            "Audited flows"
        );
        Ok(decisions)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn add_group(&self, group: AutoScalingGroup) -> Result<(), ControllerError> {
        let name = group.name().to_string();
        if self.groups.contains_key(&name) {
            return Err(ControllerError::GroupExists(name));
        }
        self.groups.insert(name, Arc::new(Mutex::new(group)));
        Ok(())
    }

    pub fn get_group(&self, name: &str) -> Result<SharedGroup, ControllerError> {
        self.groups
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| ControllerError::GroupNotFound(name.to_string()))
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Handles cloned out of the map so no shard lock is held while a
    /// group lock is taken
    fn group_handles(&self) -> Vec<SharedGroup> {
        self.groups.iter().map(|r| r.value().clone()).collect()
    }

    /// Run `f` with the named group locked
    pub fn with_group<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut AutoScalingGroup) -> T,
    ) -> Result<T, ControllerError> {
        let group = self.get_group(name)?;
        let mut guard = group.lock();
        Ok(f(&mut guard))
    }

    pub fn group_status(&self, name: &str) -> Result<GroupStatus, ControllerError> {
        self.with_group(name, |g| g.get_status())
    }

    /// Statuses sorted by group name
    pub fn list_group_statuses(&self) -> Vec<GroupStatus> {
        let mut list: Vec<_> = self.group_handles().iter().map(|g| g.lock().get_status()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn stats(&self) -> FleetStats {
        let mut stats = FleetStats {
            security_groups: self.security_groups.len(),
            ..Default::default()
        };
        for handle in self.group_handles() {
            let group = handle.lock();
            stats.groups += 1;
            if group.state() == GroupState::Running {
                stats.running_groups += 1;
            }
            stats.active_instances += group.current_size();
            stats.warm_instances += group.warm_pool().map_or(0, |p| p.current_size());
        }
        stats
    }

    /// Start every group that has not been started yet
    pub fn start_all(&self) -> Result<usize, ControllerError> {
        let mut started = 0;
        for handle in self.group_handles() {
            let mut group = handle.lock();
            if group.state() == GroupState::NotStarted {
                group.start()?;
                started += 1;
            }
        }
        Ok(started)
    }

    pub fn stop_all(&self) {
        for handle in self.group_handles() {
            handle.lock().stop();
        }
    }

    /// One reconcile pass over every group, in name order
    pub fn reconcile_all(&self) -> Vec<(String, ReconcileOutcome)> {
        self.group_names()
            .into_iter()
            .filter_map(|name| {
                let handle = self.groups.get(&name).map(|r| r.clone())?;
                let outcome = handle.lock().reconcile();
                Some((name, outcome))
            })
            .collect()
    }

    pub fn simulate_traffic(&self, name: &str, load: f64) -> Result<GroupStatus, ControllerError> {
        let status = self.with_group(name, |g| {
            g.simulate_traffic(load)?;
            Ok::<_, GroupError>(g.get_status())
        })??;
        Ok(status)
    }

    /// Record one metric sample per instance id. Returns how many matched.
    pub fn record_metric(
        &self,
        name: &str,
        kind: MetricKind,
        samples: &HashMap<String, f64>,
    ) -> Result<usize, ControllerError> {
        Ok(self.with_group(name, |g| g.record_metric(kind, samples))??)
    }

    pub fn evaluate(&self, name: &str) -> Result<ScalingActivity, ControllerError> {
        Ok(self.with_group(name, |g| g.evaluate_metrics())??)
    }

    pub fn check_health(&self, name: &str) -> Result<Vec<Replacement>, ControllerError> {
        Ok(self.with_group(name, |g| g.check_health())??)
    }

    // =========================================================================
    // Manual Scaling
    // =========================================================================

    /// Apply a manual scaling request.
    ///
    /// A step against a capacity bound is answered with `success: false` and
    /// no change. An unknown action, a missing capacity or a target outside
    /// the bounds is rejected before the group is touched.
    pub fn handle_scaling_request(
        &self,
        name: &str,
        request: &ScalingRequest,
    ) -> Result<ScalingResponse, ControllerError> {
        let handle = self.get_group(name)?;
        let action: ScalingAction = request.action.parse()?;
        let mut group = handle.lock();

        let (min_size, max_size) = (group.min_size(), group.max_size());
        let response = |previous: usize, new: usize, success: bool, message: Option<String>| ScalingResponse {
            previous_capacity: previous,
            new_capacity: new,
            min_size,
            max_size,
            success,
            message,
        };

        let result = match action {
            ScalingAction::ScaleOut => group.scale_out(),
            ScalingAction::ScaleIn => group.scale_in(),
            ScalingAction::SetCapacity => {
                let capacity = request.capacity.ok_or_else(|| {
                    ControllerError::InvalidScalingRequest("set_capacity requires a capacity".into())
                })?;
                if capacity < min_size || capacity > max_size {
                    return Err(ControllerError::InvalidScalingRequest(format!(
                        "capacity {} is outside {}..={}",
                        capacity, min_size, max_size
                    )));
                }
                group.set_desired_capacity(capacity)
            }
        };

        let current = group.current_size();
        let reply = match result {
            Ok(change) => {
                info!(group = %name, action = %request.action, from = change.previous, to = change.new, "Manual scaling applied");
                response(change.previous, change.new, true, None)
            }
            Err(e) if e.is_capacity_bound() => {
                debug!(group = %name, action = %request.action, reason = %e, "Manual scaling refused");
                response(current, current, false, Some(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(reply)
    }
}
