//! Traffic authorization: protocol/port/CIDR rules with stateful replies

pub mod resource;
pub mod rule;
pub mod security_group;
pub mod traffic;

pub use resource::{
    audit_traffic, DatabaseInstance, FlowCheck, FlowDecision, FlowDirection, FunctionResource,
    Invocation, Resource, SecurityGroupAttachments,
};
pub use rule::{Direction, RuleError, RuleSpec, SecurityGroupRule};
pub use security_group::{
    GroupType, OpenPorts, SecurityGroup, SecurityGroupSpec, SecurityGroupSummary,
    SharedSecurityGroup,
};
pub use traffic::{IpRange, PortRange, Protocol, Traffic, ANY_PORT};
