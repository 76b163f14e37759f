//! CLI module for fleetsim
//!
//! Subcommands:
//! - `fleetsim serve` - Run the fleet with its reconciler and management API
//! - `fleetsim simulate` - Drive groups through a load schedule with failures
//! - `fleetsim status` - Show fleet or group status from a running server
//! - `fleetsim scale` - Manually scale a group on a running server
//! - `fleetsim validate-sg` - Check the secure/open validation targets
//! - `fleetsim check-traffic` - Audit sample flows against demo resources
//! - `fleetsim validate` - Validate a manifest file

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::network::GroupType;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Default management API port
pub const DEFAULT_PORT: u16 = 8181;

#[derive(Parser, Debug)]
#[command(name = "fleetsim")]
#[command(about = "Simulate an elastic compute fleet with auto-scaling and security groups")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Fleet manifest (YAML or JSON). The built-in demo fleet is used when omitted.
    #[arg(long, global = true, env = "FLEETSIM_MANIFEST")]
    pub manifest: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the fleet: reconciler plus management API
    Serve(ServeArgs),

    /// Run the load and failure simulation locally
    Simulate(SimulateArgs),

    /// Show fleet status from a running server
    Status(StatusArgs),

    /// Scale a group on a running server
    Scale(ScaleArgs),

    /// Validate the secure or open security group
    #[command(name = "validate-sg")]
    ValidateSg(ValidateSgArgs),

    /// Audit sample traffic against the demo resources
    #[command(name = "check-traffic")]
    CheckTraffic(CheckTrafficArgs),

    /// Validate a manifest file
    Validate(ValidateArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the server
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// State file (default: ~/.fleetsim/state.json)
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Do not read or write a state file
    #[arg(long, conflicts_with = "state_file")]
    pub no_state: bool,

    /// Ignore saved state and start from the manifest
    #[arg(long)]
    pub fresh: bool,

    /// Override the manifest's reconciler tick (seconds)
    #[arg(long)]
    pub tick_secs: Option<u64>,

    /// Path to a .env file
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

/// Arguments for the simulate command
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Group to simulate (default: every group in the manifest)
    #[arg(short, long)]
    pub group: Option<String>,

    /// Number of cycles
    #[arg(long, default_value_t = 9)]
    pub cycles: usize,

    /// Chance per cycle that one instance fails (0.0 - 1.0)
    #[arg(long, default_value_t = 0.2)]
    pub failure_rate: f64,

    /// Seed for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the reports as JSON
    #[arg(long)]
    pub json: bool,
}

/// Connection to a running server
#[derive(Parser, Debug)]
pub struct RemoteArgs {
    /// Management API URL
    #[arg(long, env = "FLEETSIM_URL", default_value = "http://localhost:8181")]
    pub url: String,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Show a single group in detail
    pub group: Option<String>,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDirection {
    Out,
    In,
    Set,
}

/// Arguments for the scale command
#[derive(Parser, Debug)]
pub struct ScaleArgs {
    /// Group name
    pub group: String,

    /// Scale out, scale in, or set an exact capacity
    #[arg(value_enum)]
    pub direction: ScaleDirection,

    /// Target capacity (required with `set`)
    #[arg(short, long, required_if_eq("direction", "set"))]
    pub capacity: Option<usize>,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

/// Arguments for the validate-sg command
#[derive(Parser, Debug)]
pub struct ValidateSgArgs {
    /// Which validation target to check
    pub group_type: GroupType,

    /// Ask a running server instead of checking the manifest locally
    #[arg(long)]
    pub url: Option<String>,
}

/// Arguments for the check-traffic command
#[derive(Parser, Debug)]
pub struct CheckTrafficArgs {
    /// Print the audit as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the manifest file
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_defaults() {
        let cli = Cli::try_parse_from(["fleetsim", "serve"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, DEFAULT_PORT);
                assert!(!args.no_state);
                assert!(args.tick_secs.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_scale_set_requires_capacity() {
        assert!(Cli::try_parse_from(["fleetsim", "scale", "web", "set"]).is_err());

        let cli = Cli::try_parse_from(["fleetsim", "-vv", "scale", "web", "set", "-c", "3"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Scale(args) => {
                assert_eq!(args.direction, ScaleDirection::Set);
                assert_eq!(args.capacity, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_validate_sg() {
        let cli = Cli::try_parse_from(["fleetsim", "validate-sg", "secure"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::ValidateSg(ValidateSgArgs {
                group_type: GroupType::Secure,
                url: None
            })
        ));
        assert!(Cli::try_parse_from(["fleetsim", "validate-sg", "wide-open"]).is_err());
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "fleetsim", "simulate", "--group", "web-servers-warm-pool", "--seed", "7", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.group.as_deref(), Some("web-servers-warm-pool"));
                assert_eq!(args.cycles, 9);
                assert_eq!(args.seed, Some(7));
                assert!(args.json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
