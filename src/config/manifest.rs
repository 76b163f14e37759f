//! Fleet manifest: security groups, templates, groups and control-loop settings
//!
//! Parsing and validation are pure functions over strings. File access lives
//! in the parent module.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fleet::{HealthCheck, PolicySpec, ReusePolicy, TemplateSpec, WarmPool};
use crate::network::{Direction, GroupType, RuleError, SecurityGroupSpec};

/// Default reconciler tick
pub const DEFAULT_TICK_SECS: u64 = 10;

/// Ticks between state saves
pub const DEFAULT_SAVE_EVERY: u32 = 6;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to parse manifest: {0}")]
    ParseError(String),

    #[error("Duplicate {0} '{1}'")]
    DuplicateId(&'static str, String),

    #[error("Security group '{0}' referenced by '{1}' is not defined")]
    UndefinedSecurityGroup(String, String),

    #[error("Launch template '{0}' referenced by group '{1}' is not defined")]
    UndefinedTemplate(String, String),

    #[error("Invalid rule in security group '{0}': {1}")]
    InvalidRule(String, RuleError),

    #[error("Group '{0}': {1}")]
    InvalidGroup(String, String),
}

/// The whole fleet description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupSpec>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub validation: ValidationTargets,
    #[serde(default)]
    pub reconciler: ReconcilerSpec,
}

/// One auto-scaling group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    /// Launch template id
    pub template: String,
    pub min_size: usize,
    pub max_size: usize,
    pub desired_capacity: usize,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPoolSpec>,
    #[serde(default)]
    pub scale_out_policies: Vec<PolicySpec>,
    #[serde(default)]
    pub scale_in_policies: Vec<PolicySpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolSpec {
    pub size: usize,
    #[serde(default)]
    pub min_size: usize,
    #[serde(default)]
    pub reuse_policy: ReusePolicy,
    /// Fixes the random reuse order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl WarmPoolSpec {
    pub fn build(&self) -> WarmPool {
        match self.seed {
            Some(seed) => WarmPool::with_seed(self.size, self.min_size, self.reuse_policy, seed),
            None => WarmPool::new(self.size, self.min_size, self.reuse_policy),
        }
    }
}

/// Which security group answers each validation query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidationTargets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,
}

impl ValidationTargets {
    pub fn get(&self, group_type: GroupType) -> Option<&str> {
        match group_type {
            GroupType::Secure => self.secure.as_deref(),
            GroupType::Open => self.open.as_deref(),
        }
    }
}

/// Control-loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerSpec {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Save state every N ticks; 0 disables periodic saves
    #[serde(default = "default_save_every")]
    pub save_every: u32,
}

impl Default for ReconcilerSpec {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            save_every: DEFAULT_SAVE_EVERY,
        }
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}

fn default_save_every() -> u32 {
    DEFAULT_SAVE_EVERY
}

// ============================================================================
// SBIO: Pure parsing and validation
// ============================================================================

pub fn parse_manifest_yaml(content: &str) -> Result<Manifest, ManifestError> {
    serde_yaml::from_str(content).map_err(|e| ManifestError::ParseError(e.to_string()))
}

pub fn parse_manifest_json(content: &str) -> Result<Manifest, ManifestError> {
    serde_json::from_str(content).map_err(|e| ManifestError::ParseError(e.to_string()))
}

fn check_unique<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a String>,
) -> Result<HashSet<&'a str>, ManifestError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(ManifestError::DuplicateId(kind, id.clone()));
        }
    }
    Ok(seen)
}

/// Check ids, references, rules, bounds and policies
pub fn validate_manifest(manifest: &Manifest) -> Result<(), ManifestError> {
    let sg_ids = check_unique("security group", manifest.security_groups.iter().map(|s| &s.id))?;
    let template_ids = check_unique("launch template", manifest.templates.iter().map(|t| &t.id))?;
    check_unique("group", manifest.groups.iter().map(|g| &g.name))?;

    for sg in &manifest.security_groups {
        let rules = sg
            .ingress
            .iter()
            .map(|r| (r, Direction::Ingress))
            .chain(sg.egress.iter().map(|r| (r, Direction::Egress)));
        for (rule, direction) in rules {
            rule.build(direction)
                .map_err(|e| ManifestError::InvalidRule(sg.id.clone(), e))?;
        }
    }

    for template in &manifest.templates {
        for sg in &template.security_groups {
            if !sg_ids.contains(sg.as_str()) {
                return Err(ManifestError::UndefinedSecurityGroup(
                    sg.clone(),
                    template.id.clone(),
                ));
            }
        }
    }

    for group in &manifest.groups {
        validate_group(group, &template_ids)?;
    }

    for target in [&manifest.validation.secure, &manifest.validation.open]
        .into_iter()
        .flatten()
    {
        if !sg_ids.contains(target.as_str()) {
            return Err(ManifestError::UndefinedSecurityGroup(
                target.clone(),
                "validation".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_group(group: &GroupSpec, template_ids: &HashSet<&str>) -> Result<(), ManifestError> {
    let invalid = |msg: String| ManifestError::InvalidGroup(group.name.clone(), msg);

    if !template_ids.contains(group.template.as_str()) {
        return Err(ManifestError::UndefinedTemplate(
            group.template.clone(),
            group.name.clone(),
        ));
    }

    if group.min_size > group.desired_capacity || group.desired_capacity > group.max_size {
        return Err(invalid(format!(
            "bounds must satisfy min <= desired <= max (got {} / {} / {})",
            group.min_size, group.desired_capacity, group.max_size
        )));
    }

    if let Some(pool) = &group.warm_pool {
        if pool.min_size > pool.size {
            return Err(invalid(format!(
                "warm pool min_size {} exceeds size {}",
                pool.min_size, pool.size
            )));
        }
    }

    for policy in group.scale_out_policies.iter().chain(&group.scale_in_policies) {
        if policy.adjustment == 0 {
            return Err(invalid(format!(
                "policy on {} has a zero adjustment",
                policy.metric
            )));
        }
        if !policy.threshold.is_finite() {
            return Err(invalid(format!(
                "policy on {} has a non-finite threshold",
                policy.metric
            )));
        }
    }

    Ok(())
}

impl Manifest {
    /// Parse and validate YAML. Pure function - no I/O.
    pub fn from_yaml(content: &str) -> Result<Self, ManifestError> {
        let manifest = parse_manifest_yaml(content)?;
        validate_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Parse and validate JSON. Pure function - no I/O.
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let manifest = parse_manifest_json(content)?;
        validate_manifest(&manifest)?;
        Ok(manifest)
    }

    pub fn group(&self, name: &str) -> Option<&GroupSpec> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn template(&self, id: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// The built-in demo fleet
    pub fn demo() -> Self {
        parse_manifest_yaml(DEMO_MANIFEST).unwrap_or_default()
    }
}

/// Web, admin, database and internal groups, two validation targets,
/// and a standard group next to a warm-pool group
pub const DEMO_MANIFEST: &str = r#"
security_groups:
  - id: sg-001
    name: web-sg
    description: Allows HTTP/HTTPS traffic
    ingress:
      - { protocol: tcp, from_port: 80, to_port: 80, cidrs: ["0.0.0.0/0"] }
      - { protocol: tcp, from_port: 443, to_port: 443, cidrs: ["0.0.0.0/0"] }
  - id: sg-002
    name: admin-sg
    description: Allows SSH access
    ingress:
      - { protocol: tcp, from_port: 22, to_port: 22, cidrs: ["10.0.0.0/8"] }
  - id: sg-003
    name: db-sg
    description: Database access
    ingress:
      - { protocol: tcp, from_port: 3306, to_port: 3306, cidrs: ["10.0.0.0/8"] }
  - id: sg-004
    name: internal
    description: Internal network traffic
    ingress:
      - { protocol: "-1", cidrs: ["10.0.0.0/8"] }
  - id: sg-secure
    name: secure-sg
    description: HTTP only
    ingress:
      - { protocol: tcp, from_port: 80, to_port: 80, cidrs: ["0.0.0.0/0"] }
  - id: sg-open
    name: open-sg
    description: Everything from everywhere
    ingress:
      - { protocol: "-1", cidrs: ["0.0.0.0/0"] }

templates:
  - id: lt-web-001
    instance_type: t2.micro
    image_id: ami-12345
    security_groups: [sg-001]

groups:
  - name: web-servers-standard
    template: lt-web-001
    min_size: 1
    max_size: 5
    desired_capacity: 2
    scale_out_policies:
      - { metric: cpu_utilization, threshold: 70.0, adjustment: 1, comparison: greater, cooldown_secs: 60 }
    scale_in_policies:
      - { metric: cpu_utilization, threshold: 30.0, adjustment: 1, comparison: less, cooldown_secs: 60 }
  - name: web-servers-warm-pool
    template: lt-web-001
    min_size: 1
    max_size: 5
    desired_capacity: 2
    warm_pool:
      size: 3
      min_size: 1
      reuse_policy: oldest_first
    scale_out_policies:
      - { metric: cpu_utilization, threshold: 70.0, adjustment: 2, comparison: greater, cooldown_secs: 60 }
    scale_in_policies:
      - { metric: cpu_utilization, threshold: 30.0, adjustment: 1, comparison: less, cooldown_secs: 60 }

validation:
  secure: sg-secure
  open: sg-open
"#;
