//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{ResourceAudit, ValidationResult};
use crate::fleet::{FleetStats, GroupStatus, ScalingResponse, SimulationReport, ValidationReport};
use crate::network::FlowDirection;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

// ============================================================================
// Fleet and group display
// ============================================================================

pub fn format_fleet_status(stats: &FleetStats) -> String {
    let mut output = String::new();

    output.push_str("Fleet Status\n");
    output.push_str("============\n\n");
    output.push_str(&format!(
        "Groups:           {}/{} running\n",
        stats.running_groups, stats.groups
    ));
    output.push_str(&format!("Active instances: {}\n", stats.active_instances));
    output.push_str(&format!("Warm instances:   {}\n", stats.warm_instances));
    output.push_str(&format!("Security groups:  {}\n", stats.security_groups));

    output
}

pub fn format_group_list(groups: &[GroupStatus]) -> String {
    let headers = &["NAME", "STATE", "MIN", "MAX", "DESIRED", "CURRENT", "WARM"];
    let rows: Vec<Vec<String>> = groups
        .iter()
        .map(|g| {
            vec![
                g.name.clone(),
                g.state.to_string(),
                g.min_size.to_string(),
                g.max_size.to_string(),
                g.desired_capacity.to_string(),
                g.current_size.to_string(),
                g.warm_pool
                    .as_ref()
                    .map(|w| format!("{}/{}", w.current_size, w.size))
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    format_table(headers, rows)
}

pub fn format_group_detail(group: &GroupStatus) -> String {
    let mut output = String::new();

    output.push_str(&format!("Name:     {}\n", group.name));
    output.push_str(&format!("State:    {}\n", group.state));
    output.push_str(&format!(
        "Capacity: {} (min {}, max {}, desired {})\n",
        group.current_size, group.min_size, group.max_size, group.desired_capacity
    ));

    if let Some(pool) = &group.warm_pool {
        output.push_str(&format!(
            "Warm pool: {} of {} ready (min {}, {:?}, {:?})\n",
            pool.current_size, pool.size, pool.min_size, pool.reuse_policy, pool.state
        ));
    }

    output.push_str("\nInstances:\n");
    let rows: Vec<Vec<String>> = group
        .instances
        .iter()
        .map(|i| {
            vec![
                i.id.clone(),
                i.state.to_string(),
                i.health.to_string(),
                format!("{:.1}%", i.cpu_utilization),
            ]
        })
        .collect();
    output.push_str(&format_table(&["ID", "STATE", "HEALTH", "CPU"], rows));

    output
}

pub fn format_scaling_response(group: &str, response: &ScalingResponse) -> String {
    if response.success {
        format!(
            "✓ {}: {} -> {} instances (bounds {}..={})\n",
            group,
            response.previous_capacity,
            response.new_capacity,
            response.min_size,
            response.max_size
        )
    } else {
        format!(
            "✗ {}: unchanged at {} instances: {}\n",
            group,
            response.new_capacity,
            response.message.as_deref().unwrap_or("no change")
        )
    }
}

// ============================================================================
// Validation display
// ============================================================================

/// Format manifest validation result for display
pub fn format_validation_result(result: &ValidationResult, path: &str) -> String {
    let mut output = String::new();

    if result.valid {
        output.push_str(&format!("✓ {} is valid\n\n", path));
        output.push_str(&format!("  Security groups: {}\n", result.security_groups));
        output.push_str(&format!("  Templates:       {}\n", result.templates));
        output.push_str(&format!("  Groups:          {}\n", result.groups));
    } else {
        output.push_str(&format!("✗ {} is invalid\n\n", path));
        if let Some(ref error) = result.error {
            output.push_str(&format!("  Error: {}\n", error));
        }
    }

    output
}

pub fn format_validation_report(report: &ValidationReport) -> String {
    let mark = if report.is_correctly_configured { "✓" } else { "✗" };
    format!(
        "{} {} group {}: open ports {} ({})\n",
        mark,
        report.group_type,
        report.group_id,
        report.open_ports,
        if report.is_correctly_configured {
            "correctly configured"
        } else {
            "misconfigured"
        }
    )
}

// ============================================================================
// Traffic and simulation display
// ============================================================================

pub fn format_traffic_audit(audits: &[ResourceAudit]) -> String {
    let mut output = String::new();

    for audit in audits {
        output.push_str(&format!(
            "{} {} [{}]\n",
            audit.kind,
            audit.resource,
            audit.security_groups.join(", ")
        ));
        for decision in &audit.decisions {
            let arrow = match decision.direction {
                FlowDirection::Inbound => "in ",
                FlowDirection::Outbound => "out",
            };
            output.push_str(&format!(
                "  {} {}  {}\n",
                arrow,
                decision.traffic,
                if decision.allowed { "ALLOWED" } else { "DENIED" }
            ));
        }
        if let Some(invocation) = &audit.invocation {
            output.push_str(&format!(
                "  invoke -> {} {}\n",
                invocation.status_code, invocation.payload
            ));
        }
        output.push('\n');
    }

    output
}

pub fn format_simulation_report(report: &SimulationReport) -> String {
    let mut output = String::new();

    output.push_str(&format!("Simulation: {}\n", report.group));
    output.push_str(&format!("{}\n", "=".repeat(12 + report.group.len())));

    let rows: Vec<Vec<String>> = report
        .cycles
        .iter()
        .map(|c| {
            let replaced: Vec<&str> = c.replacements.iter().map(|r| r.removed.as_str()).collect();
            vec![
                c.cycle.to_string(),
                format!("{:.0}%", c.load),
                format!("{:.1}%", c.activity.aggregate.avg_cpu_utilization),
                format!("+{} -{}", c.activity.added.len(), c.activity.removed.len()),
                if replaced.is_empty() {
                    "-".to_string()
                } else {
                    replaced.join(",")
                },
                c.failed_instance.clone().unwrap_or_else(|| "-".to_string()),
                c.status.current_size.to_string(),
                c.status
                    .warm_pool
                    .as_ref()
                    .map(|w| w.current_size.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    output.push_str(&format_table(
        &["CYCLE", "LOAD", "AVG CPU", "SCALED", "REPLACED", "FAILED", "ACTIVE", "WARM"],
        rows,
    ));

    output.push_str(&format!(
        "\nFinal: {} with {} active instances\n",
        report.final_status.state, report.final_status.current_size
    ));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::GroupState;
    use crate::network::{GroupType, OpenPorts};

    fn status() -> GroupStatus {
        GroupStatus {
            name: "web-servers-standard".to_string(),
            state: GroupState::Running,
            min_size: 1,
            max_size: 5,
            desired_capacity: 2,
            current_size: 0,
            instances: Vec::new(),
            warm_pool: None,
        }
    }

    #[test]
    fn test_format_table() {
        let headers = &["NAME", "AGE"];
        let rows = vec![
            vec!["Alice".to_string(), "30".to_string()],
            vec!["Bob".to_string(), "25".to_string()],
        ];

        let output = format_table(headers, rows);
        assert!(output.contains("NAME"));
        assert!(output.contains("Alice"));
        assert!(output.contains("Bob"));
    }

    #[test]
    fn test_format_table_empty() {
        let headers = &["NAME"];
        let rows: Vec<Vec<String>> = vec![];

        let output = format_table(headers, rows);
        assert!(output.contains("No resources found"));
    }

    #[test]
    fn test_format_group_list() {
        let output = format_group_list(&[status()]);
        assert!(output.contains("web-servers-standard"));
        assert!(output.contains("running"));
    }

    #[test]
    fn test_format_scaling_refused() {
        let response = ScalingResponse {
            previous_capacity: 5,
            new_capacity: 5,
            min_size: 1,
            max_size: 5,
            success: false,
            message: Some("Already at maximum capacity: 5".to_string()),
        };
        let output = format_scaling_response("web", &response);
        assert!(output.contains("✗"));
        assert!(output.contains("maximum capacity"));
    }

    #[test]
    fn test_format_validation_report() {
        let report = ValidationReport {
            group_id: "sg-open".to_string(),
            group_type: GroupType::Open,
            open_ports: OpenPorts::All,
            is_correctly_configured: true,
        };
        let output = format_validation_report(&report);
        assert!(output.contains("all ports"));
        assert!(output.contains("correctly configured"));
    }

    #[test]
    fn test_format_validation_invalid() {
        let result = ValidationResult {
            valid: false,
            security_groups: 0,
            templates: 0,
            groups: 0,
            error: Some("Parse error".to_string()),
        };

        let output = format_validation_result(&result, "fleet.yaml");
        assert!(output.contains("✗"));
        assert!(output.contains("invalid"));
        assert!(output.contains("Parse error"));
    }
}
