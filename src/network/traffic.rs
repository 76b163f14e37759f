//! Flow and address-range value types used by security group rules

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use super::rule::RuleError;

/// Port sentinel meaning "any port"
pub const ANY_PORT: i32 = -1;

/// Network protocol of a flow or rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "icmp")]
    Icmp,
    /// Wildcard: matches every protocol
    #[serde(rename = "-1", alias = "all")]
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "-1",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::All => "ALL",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "-1" | "all" => Ok(Protocol::All),
            other => Err(RuleError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A single flow attempt between two addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
}

impl Traffic {
    pub fn new(source_ip: IpAddr, destination_ip: IpAddr, protocol: Protocol, port: u16) -> Self {
        Self {
            source_ip,
            destination_ip,
            protocol,
            port,
        }
    }

    /// Build a flow from textual addresses
    pub fn parse(
        source_ip: &str,
        destination_ip: &str,
        protocol: Protocol,
        port: u16,
    ) -> Result<Self, RuleError> {
        Ok(Self::new(
            parse_addr(source_ip)?,
            parse_addr(destination_ip)?,
            protocol,
            port,
        ))
    }

    /// The reply flow: endpoints swapped, same protocol and port
    pub fn reversed(&self) -> Self {
        Self {
            source_ip: self.destination_ip,
            destination_ip: self.source_ip,
            protocol: self.protocol,
            port: self.port,
        }
    }
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} ({})",
            self.source_ip, self.port, self.destination_ip, self.protocol
        )
    }
}

fn parse_addr(s: &str) -> Result<IpAddr, RuleError> {
    s.trim()
        .parse()
        .map_err(|_| RuleError::InvalidAddress(s.to_string()))
}

/// A CIDR block. Parsing happens once, at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpRange {
    network: IpNet,
}

impl IpRange {
    pub fn new(cidr: &str) -> Result<Self, RuleError> {
        let network: IpNet = cidr
            .trim()
            .parse()
            .map_err(|e| RuleError::InvalidCidr(cidr.to_string(), format!("{}", e)))?;
        Ok(Self {
            network: network.trunc(),
        })
    }

    /// `0.0.0.0/0`
    pub fn any_ipv4() -> Self {
        Self {
            network: IpNet::V4(Ipv4Net::default()),
        }
    }

    /// Membership test. Mixed address families never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.network.contains(ip)
    }

    pub fn cidr(&self) -> String {
        self.network.to_string()
    }
}

impl TryFrom<String> for IpRange {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IpRange::new(&value)
    }
}

impl From<IpRange> for String {
    fn from(range: IpRange) -> Self {
        range.cidr()
    }
}

/// Inclusive port interval of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Any,
    Range { from: u16, to: u16 },
}

impl PortRange {
    /// Validate raw bounds; `-1` on either side selects [`PortRange::Any`]
    pub fn from_bounds(from_port: i32, to_port: i32) -> Result<Self, RuleError> {
        if from_port == ANY_PORT || to_port == ANY_PORT {
            return Ok(PortRange::Any);
        }

        let from = u16::try_from(from_port).map_err(|_| RuleError::PortOutOfRange(from_port))?;
        let to = u16::try_from(to_port).map_err(|_| RuleError::PortOutOfRange(to_port))?;

        if from > to {
            return Err(RuleError::InvertedPortRange {
                from: from_port,
                to: to_port,
            });
        }

        Ok(PortRange::Range { from, to })
    }

    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortRange::Any => true,
            PortRange::Range { from, to } => from <= port && port <= to,
        }
    }

    /// Raw bounds, with the `-1` sentinel for [`PortRange::Any`]
    pub fn bounds(&self) -> (i32, i32) {
        match *self {
            PortRange::Any => (ANY_PORT, ANY_PORT),
            PortRange::Range { from, to } => (from as i32, to as i32),
        }
    }
}
