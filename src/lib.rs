//! fleetsim: an elastic compute fleet simulator.
//!
//! Stateful security groups decide which flows reach a resource. Auto-scaling
//! groups keep a bounded set of instances alive, scale on metric policies,
//! replace unhealthy instances and draw on warm pools of pre-built instances.

pub mod cli;
pub mod config;
pub mod fleet;
pub mod network;
pub mod server;
pub mod store;
