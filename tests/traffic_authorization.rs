//! Integration tests for stateful security-group authorization
//!
//! These tests build security groups through the public API and check the
//! decisions a resource makes for inbound flows, replies and audits.

use std::net::IpAddr;

use fleetsim::network::{
    audit_traffic, DatabaseInstance, FlowCheck, FlowDirection, GroupType, OpenPorts, Protocol,
    Resource, RuleError, SecurityGroup, Traffic,
};
use fleetsim::fleet::Instance;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn tcp(src: &str, dst: &str, port: u16) -> Traffic {
    Traffic::parse(src, dst, Protocol::Tcp, port).unwrap()
}

fn web_server() -> Instance {
    let sg = SecurityGroup::shared("sg-001", "web-sg", "Allows HTTP/HTTPS traffic");
    sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();
    sg.add_ingress_rule(Protocol::Tcp, 443, 443, "0.0.0.0/0").unwrap();

    let mut instance = Instance::new("i-web01", "t2.micro", "ami-12345");
    instance.attach_security_group(sg);
    instance.start();
    instance
}

#[test]
fn test_web_server_only_accepts_http_ports() {
    let web = web_server();

    assert!(web.can_receive_traffic(&tcp("203.0.113.10", "10.0.0.5", 80)));
    assert!(web.can_receive_traffic(&tcp("203.0.113.10", "10.0.0.5", 443)));
    assert!(!web.can_receive_traffic(&tcp("203.0.113.10", "10.0.0.5", 22)));
    assert!(!web.can_receive_traffic(&tcp("203.0.113.10", "10.0.0.5", 8080)));
}

#[test]
fn test_replies_to_permitted_inbound_flows_are_allowed() {
    let sg = SecurityGroup::shared("sg-locked", "locked", "");
    sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();

    let mut instance = Instance::new("i-1", "t2.micro", "ami-1");
    instance.attach_security_group(sg.clone());

    let request = tcp("198.51.100.7", "10.0.0.5", 80);
    assert!(instance.can_receive_traffic(&request));
    assert!(instance.can_send_traffic(&request.reversed()));
    assert!(sg.allow_outbound(&request.reversed()));
}

#[test]
fn test_all_protocol_any_port_any_address_matches_everything() {
    let sg = SecurityGroup::shared("sg-open", "open-sg", "");
    sg.add_ingress_rule(Protocol::All, -1, -1, "0.0.0.0/0").unwrap();

    for protocol in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp] {
        for port in [0, 22, 443, 65535] {
            let t = Traffic::new(ip("192.0.2.44"), ip("10.9.9.9"), protocol, port);
            assert!(sg.allow_inbound(&t), "{} should be allowed", t);
        }
    }
    assert_eq!(sg.open_ports(), OpenPorts::All);
    assert!(GroupType::Open.is_satisfied_by(&sg.open_ports()));
}

#[test]
fn test_secure_group_reports_port_80() {
    let sg = SecurityGroup::shared("sg-secure", "secure-sg", "");
    sg.add_ingress_rule(Protocol::Tcp, 80, 80, "0.0.0.0/0").unwrap();

    assert_eq!(sg.open_ports(), OpenPorts::Ports(vec![80]));
    assert!(GroupType::Secure.is_satisfied_by(&sg.open_ports()));

    sg.add_ingress_rule(Protocol::Tcp, 22, 22, "10.0.0.0/8").unwrap();
    assert!(!GroupType::Secure.is_satisfied_by(&sg.open_ports()));
}

#[test]
fn test_bad_rules_are_rejected() {
    let sg = SecurityGroup::new("sg-x", "x", "");
    assert!(matches!(
        sg.add_ingress_rule(Protocol::Tcp, 80, 80, "300.0.0.0/8"),
        Err(RuleError::InvalidCidr(..))
    ));
    assert!(matches!(
        sg.add_ingress_rule(Protocol::Tcp, 443, 80, "0.0.0.0/0"),
        Err(RuleError::InvertedPortRange { .. })
    ));
    assert!(matches!(
        sg.add_ingress_rule(Protocol::Tcp, 80, 70000, "0.0.0.0/0"),
        Err(RuleError::PortOutOfRange(70000))
    ));
    assert!(sg.ingress_rules().is_empty());
}

#[test]
fn test_database_audit() {
    let sg = SecurityGroup::shared("sg-003", "db-sg", "Database access");
    sg.add_ingress_rule(Protocol::Tcp, 3306, 3306, "10.0.0.0/8").unwrap();

    let mut db = DatabaseInstance::new("db-mysql-01", "mysql", "8.0.28", ip("10.0.0.20"), 3306);
    db.attach_security_group(sg);

    let checks: Vec<FlowCheck> = ["10.0.0.5", "203.0.113.10"]
        .iter()
        .map(|src| FlowCheck {
            direction: FlowDirection::Inbound,
            traffic: db.connection_from(ip(src)),
        })
        .collect();
    let decisions = audit_traffic(&db, &checks);

    assert!(decisions[0].allowed);
    assert!(!decisions[1].allowed);

    assert!(db.detach_security_group("sg-003"));
    assert!(!db.can_receive_traffic(&checks[0].traffic));
}
