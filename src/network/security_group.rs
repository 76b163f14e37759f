//! Security groups: ordered rule sets with stateful authorization
//!
//! A group starts with a single allow-all egress rule. Rules are only ever
//! appended. Inbound flows are checked against ingress rules on their source
//! address; outbound flows are allowed either as the reply to an allowed
//! inbound flow, or by an explicit egress rule on their destination address.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rule::{Direction, RuleError, RuleSpec, SecurityGroupRule};
use super::traffic::{PortRange, Protocol, Traffic};

/// Security groups are referenced, never owned, by resources
pub type SharedSecurityGroup = Arc<SecurityGroup>;

#[derive(Debug, Default)]
struct GroupRules {
    ingress: Vec<SecurityGroupRule>,
    egress: Vec<SecurityGroupRule>,
}

/// A named, shareable set of allow rules
#[derive(Debug)]
pub struct SecurityGroup {
    id: String,
    name: String,
    description: String,
    rules: RwLock<GroupRules>,
}

impl SecurityGroup {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let rules = GroupRules {
            ingress: Vec::new(),
            egress: vec![SecurityGroupRule::allow_all_egress()],
        };
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            rules: RwLock::new(rules),
        }
    }

    /// Build a group and wrap it for sharing
    pub fn shared(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> SharedSecurityGroup {
        Arc::new(Self::new(id, name, description))
    }

    /// Rebuild a group from its serializable form
    pub fn from_spec(spec: &SecurityGroupSpec) -> Result<Self, RuleError> {
        let group = Self::new(&spec.id, &spec.name, &spec.description);
        for rule in &spec.ingress {
            group.add_rule(rule.build(Direction::Ingress)?);
        }
        for rule in &spec.egress {
            group.add_rule(rule.build(Direction::Egress)?);
        }
        Ok(group)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    // =========================================================================
    // Rule Management
    // =========================================================================

    /// Append an already-validated rule to the list for its direction
    pub fn add_rule(&self, rule: SecurityGroupRule) {
        let mut rules = self.rules.write();
        debug!(
            group = %self.id,
            direction = ?rule.direction(),
            protocol = %rule.protocol(),
            "Adding rule"
        );
        match rule.direction() {
            Direction::Ingress => rules.ingress.push(rule),
            Direction::Egress => rules.egress.push(rule),
        }
    }

    pub fn add_ingress_rule(
        &self,
        protocol: Protocol,
        from_port: i32,
        to_port: i32,
        cidr: &str,
    ) -> Result<(), RuleError> {
        let rule = SecurityGroupRule::ingress(protocol, from_port, to_port, cidr)?;
        self.add_rule(rule);
        Ok(())
    }

    pub fn add_egress_rule(
        &self,
        protocol: Protocol,
        from_port: i32,
        to_port: i32,
        cidr: &str,
    ) -> Result<(), RuleError> {
        let rule = SecurityGroupRule::egress(protocol, from_port, to_port, cidr)?;
        self.add_rule(rule);
        Ok(())
    }

    pub fn ingress_rules(&self) -> Vec<SecurityGroupRule> {
        self.rules.read().ingress.clone()
    }

    pub fn egress_rules(&self) -> Vec<SecurityGroupRule> {
        self.rules.read().egress.clone()
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// True iff some ingress rule matches the flow's source
    pub fn allow_inbound(&self, traffic: &Traffic) -> bool {
        self.rules
            .read()
            .ingress
            .iter()
            .any(|rule| rule.matches_traffic(traffic.protocol, traffic.port, &traffic.source_ip))
    }

    /// Reply flows to allowed inbound traffic pass without consulting egress rules
    pub fn allow_outbound(&self, traffic: &Traffic) -> bool {
        if self.allow_inbound(&traffic.reversed()) {
            return true;
        }

        self.rules.read().egress.iter().any(|rule| {
            rule.matches_traffic(traffic.protocol, traffic.port, &traffic.destination_ip)
        })
    }

    /// Ports opened by ingress rules, in rule order.
    ///
    /// The first rule covering every port short-circuits to [`OpenPorts::All`].
    pub fn open_ports(&self) -> OpenPorts {
        let rules = self.rules.read();
        let mut ports = Vec::new();

        for rule in &rules.ingress {
            match rule.ports() {
                PortRange::Range { from, to } if !rule.allows_all_ports() => {
                    ports.extend(from..=to)
                }
                _ => return OpenPorts::All,
            }
        }

        OpenPorts::Ports(ports)
    }

    /// Serializable form. The implicit default egress rule is left out.
    pub fn to_spec(&self) -> SecurityGroupSpec {
        let rules = self.rules.read();
        SecurityGroupSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            ingress: rules.ingress.iter().map(SecurityGroupRule::to_spec).collect(),
            egress: rules
                .egress
                .iter()
                .skip(1)
                .map(SecurityGroupRule::to_spec)
                .collect(),
        }
    }

    pub fn summary(&self) -> SecurityGroupSummary {
        let rules = self.rules.read();
        SecurityGroupSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            ingress_rules: rules.ingress.len(),
            egress_rules: rules.egress.len(),
        }
    }
}

/// Serializable security group, as written in manifests and snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ingress: Vec<RuleSpec>,
    /// Egress rules in addition to the implicit allow-all rule
    #[serde(default)]
    pub egress: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub ingress_rules: usize,
    pub egress_rules: usize,
}

// =============================================================================
// Open Ports
// =============================================================================

const ALL_PORTS: &str = "all ports";

/// Result of an open-ports query. Serializes as a port list or the string `"all ports"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenPorts {
    All,
    Ports(Vec<u16>),
}

impl OpenPorts {
    pub fn is_all(&self) -> bool {
        matches!(self, OpenPorts::All)
    }
}

impl fmt::Display for OpenPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenPorts::All => f.write_str(ALL_PORTS),
            OpenPorts::Ports(ports) if ports.is_empty() => f.write_str("none"),
            OpenPorts::Ports(ports) => {
                let list: Vec<String> = ports.iter().map(u16::to_string).collect();
                f.write_str(&list.join(", "))
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OpenPortsRepr {
    Sentinel(String),
    Ports(Vec<u16>),
}

impl Serialize for OpenPorts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OpenPorts::All => serializer.serialize_str(ALL_PORTS),
            OpenPorts::Ports(ports) => ports.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OpenPorts {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match OpenPortsRepr::deserialize(deserializer)? {
            OpenPortsRepr::Sentinel(s) if s == ALL_PORTS => Ok(OpenPorts::All),
            OpenPortsRepr::Sentinel(s) => Err(serde::de::Error::custom(format!(
                "expected a port list or '{}', got '{}'",
                ALL_PORTS, s
            ))),
            OpenPortsRepr::Ports(ports) => Ok(OpenPorts::Ports(ports)),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Expected shape of a group being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    /// Only port 80 open
    Secure,
    /// Every port open
    Open,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Secure => "secure",
            GroupType::Open => "open",
        }
    }

    pub fn is_satisfied_by(&self, open_ports: &OpenPorts) -> bool {
        match self {
            GroupType::Secure => *open_ports == OpenPorts::Ports(vec![80]),
            GroupType::Open => open_ports.is_all(),
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secure" => Ok(GroupType::Secure),
            "open" => Ok(GroupType::Open),
            other => Err(format!("Unknown group type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_group() -> SecurityGroup {
        let sg = SecurityGroup::new("sg-web", "web-sg", "web servers");
        sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();
        sg.add_ingress_rule(Protocol::Tcp, 443, 443, "0.0.0.0/0").unwrap();
        sg
    }

    #[test]
    fn test_default_egress_added_once() {
        let sg = SecurityGroup::new("sg-1", "empty", "");
        let egress = sg.egress_rules();
        assert_eq!(egress.len(), 1);
        assert!(egress[0].allows_all_ports());
        assert!(sg.ingress_rules().is_empty());
    }

    #[test]
    fn test_inbound_matches_source() {
        let sg = web_group();
        let allowed = Traffic::parse("203.0.113.10", "10.0.0.5", Protocol::Tcp, 443).unwrap();
        let denied = Traffic::parse("203.0.113.10", "10.0.0.5", Protocol::Tcp, 22).unwrap();
        assert!(sg.allow_inbound(&allowed));
        assert!(!sg.allow_inbound(&denied));
    }

    #[test]
    fn test_stateful_reply_is_allowed() {
        let sg = SecurityGroup::new("sg-2", "locked", "");
        sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();

        let request = Traffic::parse("203.0.113.10", "10.0.0.5", Protocol::Tcp, 80).unwrap();
        assert!(sg.allow_inbound(&request));
        assert!(sg.allow_outbound(&request.reversed()));
    }

    #[test]
    fn test_outbound_falls_back_to_egress_rules() {
        // Only the implicit egress rule exists, so anything outbound passes
        let sg = SecurityGroup::new("sg-3", "plain", "");
        let flow = Traffic::parse("10.0.0.5", "198.51.100.1", Protocol::Udp, 53).unwrap();
        assert!(sg.allow_outbound(&flow));
    }

    #[test]
    fn test_open_ports_secure_group() {
        let sg = SecurityGroup::new("sg-secure", "secure", "");
        sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();
        assert_eq!(sg.open_ports(), OpenPorts::Ports(vec![80]));
        assert!(GroupType::Secure.is_satisfied_by(&sg.open_ports()));
        assert!(!GroupType::Open.is_satisfied_by(&sg.open_ports()));
    }

    #[test]
    fn test_open_ports_all_sentinel() {
        let sg = SecurityGroup::new("sg-open", "open", "");
        sg.add_ingress_rule(Protocol::Tcp, 22, 22, "10.0.0.0/8").unwrap();
        sg.add_ingress_rule(Protocol::All, -1, -1, "0.0.0.0/0").unwrap();
        assert_eq!(sg.open_ports(), OpenPorts::All);
        assert!(GroupType::Open.is_satisfied_by(&sg.open_ports()));
    }

    #[test]
    fn test_open_ports_expands_ranges() {
        let sg = SecurityGroup::new("sg-r", "range", "");
        sg.add_ingress_rule(Protocol::Tcp, 8000, 8002, "0.0.0.0/0").unwrap();
        sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();
        assert_eq!(sg.open_ports(), OpenPorts::Ports(vec![8000, 8001, 8002, 80]));
    }

    #[test]
    fn test_open_ports_serialization() {
        assert_eq!(serde_json::to_string(&OpenPorts::All).unwrap(), "\"all ports\"");
        assert_eq!(
            serde_json::to_string(&OpenPorts::Ports(vec![80, 443])).unwrap(),
            "[80,443]"
        );
        let parsed: OpenPorts = serde_json::from_str("\"all ports\"").unwrap();
        assert_eq!(parsed, OpenPorts::All);
    }

    #[test]
    fn test_spec_round_trip_skips_default_egress() {
        let sg = web_group();
        sg.add_egress_rule(Protocol::Tcp, 5432, 5432, "10.0.2.0/24").unwrap();

        let spec = sg.to_spec();
        assert_eq!(spec.ingress.len(), 2);
        assert_eq!(spec.egress.len(), 1);

        let rebuilt = SecurityGroup::from_spec(&spec).unwrap();
        assert_eq!(rebuilt.egress_rules().len(), 2);
        assert_eq!(rebuilt.to_spec(), spec);
    }

    #[test]
    fn test_group_type_parsing() {
        assert_eq!("secure".parse::<GroupType>().unwrap(), GroupType::Secure);
        assert_eq!("OPEN".parse::<GroupType>().unwrap(), GroupType::Open);
        assert!("restricted".parse::<GroupType>().is_err());
    }
}
