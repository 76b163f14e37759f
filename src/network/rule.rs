//! Directional allow rules and their match algorithm

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::traffic::{IpRange, PortRange, Protocol};

/// Errors raised while constructing rules. A rule that fails here is never created.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Invalid CIDR '{0}': {1}")]
    InvalidCidr(String, String),

    #[error("Invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Port {0} is outside 0-65535")]
    PortOutOfRange(i32),

    #[error("Port range {from}-{to} is inverted")]
    InvertedPortRange { from: i32, to: i32 },

    #[error("Rule has no CIDR ranges")]
    NoIpRanges,
}

/// Which side of an instance a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Serializable form of a rule, as written in manifests and snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub protocol: Protocol,
    #[serde(default = "any_port")]
    pub from_port: i32,
    #[serde(default = "any_port")]
    pub to_port: i32,
    pub cidrs: Vec<String>,
}

fn any_port() -> i32 {
    super::traffic::ANY_PORT
}

impl RuleSpec {
    pub fn build(&self, direction: Direction) -> Result<SecurityGroupRule, RuleError> {
        let cidrs: Vec<&str> = self.cidrs.iter().map(String::as_str).collect();
        SecurityGroupRule::new(
            direction,
            self.protocol,
            self.from_port,
            self.to_port,
            &cidrs,
        )
    }
}

/// A single allow rule
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroupRule {
    protocol: Protocol,
    ports: PortRange,
    ip_ranges: Vec<IpRange>,
    direction: Direction,
}

impl SecurityGroupRule {
    /// Build a rule from raw bounds and CIDR strings.
    ///
    /// Protocol `ALL` always covers every port regardless of the bounds given.
    pub fn new(
        direction: Direction,
        protocol: Protocol,
        from_port: i32,
        to_port: i32,
        cidrs: &[&str],
    ) -> Result<Self, RuleError> {
        if cidrs.is_empty() {
            return Err(RuleError::NoIpRanges);
        }

        let ports = if protocol == Protocol::All {
            PortRange::Any
        } else {
            PortRange::from_bounds(from_port, to_port)?
        };

        let ip_ranges = cidrs
            .iter()
            .map(|c| IpRange::new(c))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            protocol,
            ports,
            ip_ranges,
            direction,
        })
    }

    pub fn ingress(
        protocol: Protocol,
        from_port: i32,
        to_port: i32,
        cidr: &str,
    ) -> Result<Self, RuleError> {
        Self::new(Direction::Ingress, protocol, from_port, to_port, &[cidr])
    }

    pub fn egress(
        protocol: Protocol,
        from_port: i32,
        to_port: i32,
        cidr: &str,
    ) -> Result<Self, RuleError> {
        Self::new(Direction::Egress, protocol, from_port, to_port, &[cidr])
    }

    /// The allow-everything egress rule every group starts with
    pub fn allow_all_egress() -> Self {
        Self {
            protocol: Protocol::All,
            ports: PortRange::Any,
            ip_ranges: vec![IpRange::any_ipv4()],
            direction: Direction::Egress,
        }
    }

    /// Whether a flow with this protocol and port, seen from `ip`, is allowed
    pub fn matches_traffic(&self, protocol: Protocol, port: u16, ip: &IpAddr) -> bool {
        if self.protocol != protocol && self.protocol != Protocol::All {
            return false;
        }

        if !self.ports.contains(port) {
            return false;
        }

        self.ip_ranges.iter().any(|range| range.contains(ip))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn ip_ranges(&self) -> &[IpRange] {
        &self.ip_ranges
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_egress(&self) -> bool {
        self.direction == Direction::Egress
    }

    /// True when the rule opens every port for every protocol
    pub fn allows_all_ports(&self) -> bool {
        self.protocol == Protocol::All || self.ports == PortRange::Any
    }

    pub fn to_spec(&self) -> RuleSpec {
        let (from_port, to_port) = self.ports.bounds();
        RuleSpec {
            protocol: self.protocol,
            from_port,
            to_port,
            cidrs: self.ip_ranges.iter().map(IpRange::cidr).collect(),
        }
    }
}
