//! Resources that carry security group attachments
//!
//! Authorization for a resource is the union of its attached groups: one
//! permitting group is enough. With nothing attached every flow is denied.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::security_group::SharedSecurityGroup;
use super::traffic::{Protocol, Traffic};

/// Ordered list of attached groups. The same group may appear more than once.
#[derive(Debug, Clone, Default)]
pub struct SecurityGroupAttachments {
    groups: Vec<SharedSecurityGroup>,
}

impl SecurityGroupAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: Vec<SharedSecurityGroup>) -> Self {
        Self { groups }
    }

    pub fn attach(&mut self, group: SharedSecurityGroup) {
        self.groups.push(group);
    }

    /// Remove every attachment of the group with this id. Returns how many were removed.
    pub fn detach(&mut self, group_id: &str) -> usize {
        let before = self.groups.len();
        self.groups.retain(|g| g.id() != group_id);
        before - self.groups.len()
    }

    pub fn groups(&self) -> &[SharedSecurityGroup] {
        &self.groups
    }

    pub fn ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn can_receive(&self, traffic: &Traffic) -> bool {
        self.groups.iter().any(|g| g.allow_inbound(traffic))
    }

    pub fn can_send(&self, traffic: &Traffic) -> bool {
        self.groups.iter().any(|g| g.allow_outbound(traffic))
    }
}

/// Anything that security groups can be attached to
pub trait Resource {
    fn resource_id(&self) -> &str;

    fn attachments(&self) -> &SecurityGroupAttachments;

    fn attachments_mut(&mut self) -> &mut SecurityGroupAttachments;

    fn attach_security_group(&mut self, group: SharedSecurityGroup) {
        debug!(resource = %self.resource_id(), group = %group.id(), "Attaching security group");
        self.attachments_mut().attach(group);
    }

    fn detach_security_group(&mut self, group_id: &str) -> bool {
        let removed = self.attachments_mut().detach(group_id);
        if removed > 0 {
            debug!(resource = %self.resource_id(), group = %group_id, "Detached security group");
        }
        removed > 0
    }

    fn security_group_ids(&self) -> Vec<String> {
        self.attachments().ids()
    }

    fn can_receive_traffic(&self, traffic: &Traffic) -> bool {
        self.attachments().can_receive(traffic)
    }

    fn can_send_traffic(&self, traffic: &Traffic) -> bool {
        self.attachments().can_send(traffic)
    }
}

// =============================================================================
// Traffic Audit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Inbound,
    Outbound,
}

/// A flow to evaluate against a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowCheck {
    pub direction: FlowDirection,
    pub traffic: Traffic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDecision {
    pub direction: FlowDirection,
    pub traffic: Traffic,
    pub allowed: bool,
}

/// Evaluate each flow against the resource, in order
pub fn audit_traffic<R: Resource + ?Sized>(resource: &R, checks: &[FlowCheck]) -> Vec<FlowDecision> {
    checks
        .iter()
        .map(|check| {
            let allowed = match check.direction {
                FlowDirection::Inbound => resource.can_receive_traffic(&check.traffic),
                FlowDirection::Outbound => resource.can_send_traffic(&check.traffic),
            };
            FlowDecision {
                direction: check.direction,
                traffic: check.traffic,
                allowed,
            }
        })
        .collect()
}

// =============================================================================
// Database and Function Resources
// =============================================================================

/// A managed database reachable at a fixed address and port
#[derive(Debug, Clone)]
pub struct DatabaseInstance {
    pub id: String,
    pub engine: String,
    pub engine_version: String,
    pub endpoint: IpAddr,
    pub port: u16,
    attachments: SecurityGroupAttachments,
}

impl DatabaseInstance {
    pub fn new(
        id: impl Into<String>,
        engine: impl Into<String>,
        engine_version: impl Into<String>,
        endpoint: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            engine: engine.into(),
            engine_version: engine_version.into(),
            endpoint,
            port,
            attachments: SecurityGroupAttachments::new(),
        }
    }

    /// A flow from `source` to this database's endpoint and port
    pub fn connection_from(&self, source: IpAddr) -> Traffic {
        Traffic::new(source, self.endpoint, Protocol::Tcp, self.port)
    }
}

impl Resource for DatabaseInstance {
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

/// Outcome of a simulated function invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub function: String,
    pub status_code: u16,
    pub payload: serde_json::Value,
}

/// A serverless function attached to the network
#[derive(Debug, Clone)]
pub struct FunctionResource {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    attachments: SecurityGroupAttachments,
}

impl FunctionResource {
    pub fn new(
        name: impl Into<String>,
        runtime: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime: runtime.into(),
            handler: handler.into(),
            memory_mb: 128,
            timeout_secs: 3,
            attachments: SecurityGroupAttachments::new(),
        }
    }

    pub fn with_limits(mut self, memory_mb: u32, timeout_secs: u32) -> Self {
        self.memory_mb = memory_mb;
        self.timeout_secs = timeout_secs;
        self
    }

    /// Echo the event back as a successful invocation
    pub fn invoke(&self, event: serde_json::Value) -> Invocation {
        info!(function = %self.name, runtime = %self.runtime, "Invoking function");
        Invocation {
            function: self.name.clone(),
            status_code: 200,
            payload: serde_json::json!({
                "handler": self.handler,
                "event": event,
            }),
        }
    }
}

impl Resource for FunctionResource {
    fn resource_id(&self) -> &str {
        &self.name
    }

    fn attachments(&self) -> &SecurityGroupAttachments {
        &self.attachments
    }

    fn attachments_mut(&mut self) -> &mut SecurityGroupAttachments {
        &mut self.attachments
    }
}
