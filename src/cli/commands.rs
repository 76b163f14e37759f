//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{load_manifest_file, ConfigError, Manifest};
use crate::fleet::{
    ControllerError, FleetController, GroupError, GroupStatus, Instance, ScalingRequest,
    ScalingResponse, Simulation, SimulationConfig, SimulationReport, ValidationReport,
};
use crate::network::{
    audit_traffic, DatabaseInstance, FlowCheck, FlowDecision, FlowDirection, FunctionResource,
    GroupType, Invocation, Protocol, Resource, Traffic,
};
use crate::server::handlers::FleetStatusResponse;

use super::ScaleDirection;

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    Server(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// The manifest at `path`, or the built-in demo fleet
pub fn load_manifest(path: Option<&Path>) -> CommandResult<Manifest> {
    match path {
        Some(path) => Ok(load_manifest_file(path)?),
        None => Ok(Manifest::demo()),
    }
}

// ============================================================================
// Validation Commands
// ============================================================================

/// Validate a manifest file
pub fn validate_manifest_file(path: &Path) -> ValidationResult {
    match load_manifest_file(path) {
        Ok(manifest) => ValidationResult {
            valid: true,
            security_groups: manifest.security_groups.len(),
            templates: manifest.templates.len(),
            groups: manifest.groups.len(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            security_groups: 0,
            templates: 0,
            groups: 0,
            error: Some(e.to_string()),
        },
    }
}

/// Result of validating a manifest
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub security_groups: usize,
    pub templates: usize,
    pub groups: usize,
    pub error: Option<String>,
}

/// Validate a security group against the manifest, without a server
pub fn validate_security_group_local(
    manifest: &Manifest,
    group_type: GroupType,
) -> CommandResult<ValidationReport> {
    let controller = FleetController::from_manifest(manifest, crate::fleet::MonotonicClock::shared())?;
    Ok(controller.validate_security_group(group_type)?)
}

// ============================================================================
// Simulation
// ============================================================================

/// Simulate one group, or every group in name order
pub fn run_simulation(
    manifest: &Manifest,
    group: Option<&str>,
    config: SimulationConfig,
) -> CommandResult<Vec<SimulationReport>> {
    let mut simulation = Simulation::new(config);
    let controller = FleetController::from_manifest(manifest, simulation.clock())?;

    let names = match group {
        Some(name) => vec![name.to_string()],
        None => controller.group_names(),
    };

    let mut reports = Vec::with_capacity(names.len());
    for name in names {
        let report = controller.with_group(&name, |g| simulation.run(g))??;
        reports.push(report);
    }
    Ok(reports)
}

// ============================================================================
// Traffic Audit
// ============================================================================

const EXTERNAL_CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));
const WEB_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
const ADMIN_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));
const DATABASE_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 20));
const FUNCTION_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 30));

/// Decisions for every sample flow against one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAudit {
    pub resource: String,
    pub kind: String,
    pub security_groups: Vec<String>,
    pub decisions: Vec<FlowDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<Invocation>,
}

fn inbound(source: IpAddr, destination: IpAddr, port: u16) -> FlowCheck {
    FlowCheck {
        direction: FlowDirection::Inbound,
        traffic: Traffic::new(source, destination, Protocol::Tcp, port),
    }
}

fn audit<R: Resource>(resource: &R, kind: &str, checks: &[FlowCheck]) -> ResourceAudit {
    ResourceAudit {
        resource: resource.resource_id().to_string(),
        kind: kind.to_string(),
        security_groups: resource.security_group_ids(),
        decisions: audit_traffic(resource, checks),
        invocation: None,
    }
}

/// Build a web server, an admin host, a database and a function from the
/// manifest's sg-001..sg-004 and audit sample flows against each
pub fn traffic_audit(manifest: &Manifest) -> CommandResult<Vec<ResourceAudit>> {
    let controller = FleetController::from_manifest(manifest, crate::fleet::MonotonicClock::shared())?;
    let group = |id: &str| {
        controller
            .get_security_group(id)
            .ok_or_else(|| ControllerError::SecurityGroupNotFound(id.to_string()))
    };

    let mut web = Instance::new("i-web01", "t2.micro", "ami-12345");
    web.attach_security_group(group("sg-001")?);
    web.start();

    let mut admin = Instance::new("i-admin01", "t2.small", "ami-67890");
    admin.attach_security_group(group("sg-002")?);
    admin.attach_security_group(group("sg-004")?);
    admin.start();

    let mut database = DatabaseInstance::new("db-mysql-01", "mysql", "8.0.28", DATABASE_HOST, 3306);
    database.attach_security_group(group("sg-003")?);

    let mut function = FunctionResource::new("api-handler", "python3.9", "index.handler").with_limits(256, 10);
    function.attach_security_group(group("sg-004")?);

    let database_flows: Vec<FlowCheck> = [WEB_HOST, EXTERNAL_CLIENT]
        .into_iter()
        .map(|source| FlowCheck {
            direction: FlowDirection::Inbound,
            traffic: database.connection_from(source),
        })
        .collect();

    let mut function_audit = audit(
        &function,
        "function",
        &[
            inbound(WEB_HOST, FUNCTION_HOST, 443),
            inbound(EXTERNAL_CLIENT, FUNCTION_HOST, 443),
        ],
    );
    function_audit.invocation = Some(function.invoke(serde_json::json!({ "action": "test" })));

    Ok(vec![
        audit(
            &web,
            "instance",
            &[80, 443, 22, 8080].map(|port| inbound(EXTERNAL_CLIENT, WEB_HOST, port)),
        ),
        audit(
            &admin,
            "instance",
            &[
                inbound(WEB_HOST, ADMIN_HOST, 22),
                inbound(EXTERNAL_CLIENT, ADMIN_HOST, 22),
                inbound(WEB_HOST, ADMIN_HOST, 8080),
            ],
        ),
        audit(&database, "database", &database_flows),
        function_audit,
    ])
}

// ============================================================================
// HTTP Client for the Management API
// ============================================================================

impl ScaleDirection {
    pub fn to_request(self, capacity: Option<usize>) -> ScalingRequest {
        match self {
            ScaleDirection::Out => ScalingRequest::new("scale_out", None),
            ScaleDirection::In => ScalingRequest::new("scale_in", None),
            ScaleDirection::Set => ScalingRequest::new("set_capacity", capacity),
        }
    }
}

/// Client for a running `fleetsim serve`
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a new client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, &url)
    }

    /// Decode a success body, or turn the error body into `CommandError::Server`
    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> CommandResult<T> {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            let error = body["error"].as_str().unwrap_or("Unknown error");
            return Err(CommandError::Server(format!("{} ({})", error, status)));
        }

        Ok(serde_json::from_value(body)?)
    }

    /// Get fleet status
    pub async fn status(&self) -> CommandResult<FleetStatusResponse> {
        let resp = self
            .build_request(reqwest::Method::GET, "/v1/status")
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn list_groups(&self) -> CommandResult<Vec<GroupStatus>> {
        let resp = self
            .build_request(reqwest::Method::GET, "/v1/groups")
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn get_group(&self, name: &str) -> CommandResult<GroupStatus> {
        let path = format!("/v1/groups/{}", name);
        let resp = self.build_request(reqwest::Method::GET, &path).send().await?;
        Self::decode(resp).await
    }

    /// Send a manual scaling request
    pub async fn scale(&self, name: &str, request: &ScalingRequest) -> CommandResult<ScalingResponse> {
        let path = format!("/v1/groups/{}/scale", name);
        let resp = self
            .build_request(reqwest::Method::POST, &path)
            .json(request)
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn validate_security_group(&self, group_type: GroupType) -> CommandResult<ValidationReport> {
        let resp = self
            .build_request(reqwest::Method::POST, "/v1/security-groups/validate")
            .json(&serde_json::json!({ "group_type": group_type }))
            .send()
            .await?;
        Self::decode(resp).await
    }
}
