//! # Fleet Auto-Scaling
//!
//! Groups of instances kept between a minimum and a maximum size.
//!
//! ## Core Resources
//!
//! - **LaunchTemplate**: the recipe every new instance is built from
//! - **AutoScalingGroup**: bounded set of active instances, scaling policies,
//!   health checks and an optional warm pool of pre-built stopped instances
//! - **FleetController**: owns every group and security group and answers
//!   manual scaling and validation requests
//!
//! ## Control Flow
//!
//! ```text
//!   metrics ──> evaluate_metrics ──> add_instance / remove_instance
//!                                         │              │
//!                                   warm pool first   recycle into pool
//!
//!   reconciler tick ──> reconcile() ──> evaluate, health check when due,
//!                                       refill warm pool below its minimum
//! ```
//!
//! Time comes from a [`Clock`] so cooldowns and health-check intervals can be
//! driven by a [`ManualClock`] in tests and simulations.

pub mod clock;
pub mod controller;
pub mod group;
pub mod health;
pub mod instance;
pub mod policy;
pub mod reconciler;
pub mod simulation;
pub mod template;
pub mod warm_pool;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use controller::{
    ControllerError, FleetController, FleetStats, ScalingAction, ScalingRequest, ScalingResponse,
    SharedGroup, ValidationReport,
};
pub use group::{
    AutoScalingGroup, CapacityChange, GroupError, GroupSnapshot, GroupState, GroupStatus,
    ReconcileOutcome, Replacement, ScalingActivity,
};
pub use health::{HealthCheck, HealthCheckType};
pub use instance::{
    HealthState, HealthStatus, Instance, InstanceMetrics, InstanceRecord, InstanceSummary,
    MetricKind, RunState,
};
pub use policy::{aggregate_metrics, AggregateMetrics, Comparison, PolicySpec, ScalingPolicy};
pub use reconciler::{spawn_reconciler, ReconcilerConfig};
pub use simulation::{
    load_for_cycle, CycleReport, Simulation, SimulationConfig, SimulationReport,
};
pub use template::{LaunchTemplate, TemplateSpec};
pub use warm_pool::{ReusePolicy, WarmPool, WarmPoolRecord, WarmPoolState, WarmPoolStatus};
