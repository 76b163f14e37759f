//! Deterministic load and failure simulation
//!
//! Each cycle applies a scheduled load, evaluates policies, runs health
//! checks and then may knock one instance over. Time is virtual: the
//! simulation owns a [`ManualClock`] and advances it by a fixed step per
//! cycle, so cooldowns behave the same on every run.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::{ManualClock, SharedClock};
use super::group::{AutoScalingGroup, GroupError, GroupStatus, Replacement, ScalingActivity};
use super::instance::RunState;

/// Simulation settings
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub cycles: usize,
    /// Chance per cycle that one active instance fails
    pub failure_probability: f64,
    pub seed: Option<u64>,
    /// Virtual time between cycles
    pub cycle_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cycles: 9,
            failure_probability: 0.2,
            seed: None,
            cycle_interval: Duration::from_secs(30),
        }
    }
}

/// Load for a zero-based cycle: normal, then a spike, then quiet
pub fn load_for_cycle(cycle: usize) -> f64 {
    match cycle {
        0..=2 => 50.0,
        3..=5 => 85.0,
        _ => 20.0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// One-based
    pub cycle: usize,
    pub load: f64,
    pub activity: ScalingActivity,
    pub replacements: Vec<Replacement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_instance: Option<String>,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub group: String,
    pub cycles: Vec<CycleReport>,
    pub final_status: GroupStatus,
}

/// Drives one group at a time through the load schedule
pub struct Simulation {
    config: SimulationConfig,
    clock: ManualClock,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            clock: ManualClock::new(),
            rng,
        }
    }

    /// Clock to build simulated groups with
    pub fn clock(&self) -> SharedClock {
        Arc::new(self.clock.clone())
    }

    /// Start the group, run every cycle, then stop it
    pub fn run(&mut self, group: &mut AutoScalingGroup) -> Result<SimulationReport, GroupError> {
        self.clock.set(Duration::ZERO);
        group.start()?;
        info!(group = %group.name(), cycles = self.config.cycles, "Simulation started");

        let mut cycles = Vec::with_capacity(self.config.cycles);
        for cycle in 0..self.config.cycles {
            if cycle > 0 {
                self.clock.advance(self.config.cycle_interval);
            }
            cycles.push(self.run_cycle(group, cycle)?);
        }

        group.stop();
        let final_status = group.get_status();
        info!(group = %group.name(), "Simulation complete");

        Ok(SimulationReport {
            group: group.name().to_string(),
            cycles,
            final_status,
        })
    }

    fn run_cycle(
        &mut self,
        group: &mut AutoScalingGroup,
        cycle: usize,
    ) -> Result<CycleReport, GroupError> {
        let load = load_for_cycle(cycle);
        group.simulate_traffic(load)?;

        let activity = group.evaluate_metrics()?;
        let replacements = group.check_health()?;
        let failed_instance = self.inject_failure(group);

        Ok(CycleReport {
            cycle: cycle + 1,
            load,
            activity,
            replacements,
            failed_instance,
            status: group.get_status(),
        })
    }

    /// Stop one random active instance with the configured probability
    fn inject_failure(&mut self, group: &mut AutoScalingGroup) -> Option<String> {
        if group.current_size() == 0 || self.rng.gen::<f64>() >= self.config.failure_probability {
            return None;
        }

        let index = self.rng.gen_range(0..group.current_size());
        let id = group.instances()[index].id().to_string();
        if let Some(instance) = group.instance_mut(&id) {
            instance.force_state(RunState::Stopped);
            warn!(group = %group.name(), instance = %id, "Simulated instance failure");
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{
        Clock, Comparison, LaunchTemplate, MetricKind, ReusePolicy, ScalingPolicy, WarmPool,
    };

    fn group(sim: &Simulation) -> AutoScalingGroup {
        let template = LaunchTemplate::new("lt-web-001", "t2.micro", "ami-12345", Vec::new());
        let mut asg = AutoScalingGroup::new("web-servers-standard", template, 1, 5, 2)
            .unwrap()
            .with_clock(sim.clock());
        asg.add_scale_out_policy(ScalingPolicy::new(
            MetricKind::CpuUtilization,
            70.0,
            1,
            Comparison::Greater,
            Duration::from_secs(60),
        ));
        asg.add_scale_in_policy(ScalingPolicy::new(
            MetricKind::CpuUtilization,
            30.0,
            1,
            Comparison::Less,
            Duration::from_secs(60),
        ));
        asg
    }

    #[test]
    fn test_load_schedule() {
        let loads: Vec<f64> = (0..8).map(load_for_cycle).collect();
        assert_eq!(loads, vec![50.0, 50.0, 50.0, 85.0, 85.0, 85.0, 20.0, 20.0]);
    }

    #[test]
    fn test_quiet_run_follows_load() {
        let mut sim = Simulation::new(SimulationConfig {
            failure_probability: 0.0,
            seed: Some(1),
            ..Default::default()
        });
        let mut asg = group(&sim);
        let report = sim.run(&mut asg).unwrap();

        assert_eq!(report.cycles.len(), 9);
        // No policy fires under the normal load
        assert!(report.cycles[..3].iter().all(|c| c.activity.is_empty()));
        // The spike scales out at t=90s and again at t=150s
        assert_eq!(report.cycles[3].status.current_size, 3);
        assert_eq!(report.cycles[4].status.current_size, 3);
        assert_eq!(report.cycles[5].status.current_size, 4);
        // Quiet load scales back in
        assert!(report.cycles[6].status.current_size < 4);
        assert!(report.cycles.iter().all(|c| c.failed_instance.is_none()));
        assert_eq!(report.final_status.current_size, 0);
    }

    #[test]
    fn test_bounds_hold_with_failures() {
        let mut sim = Simulation::new(SimulationConfig {
            failure_probability: 1.0,
            seed: Some(42),
            ..Default::default()
        });
        let mut asg = group(&sim).with_warm_pool(WarmPool::with_seed(3, 1, ReusePolicy::Random, 42));
        let report = sim.run(&mut asg).unwrap();

        for cycle in &report.cycles {
            assert!(cycle.failed_instance.is_some());
            assert!(cycle.status.current_size >= 1);
            assert!(cycle.status.current_size <= 5);
        }
        // A failed instance is out of service by the end of the next cycle
        for window in report.cycles.windows(2) {
            let failed = window[0].failed_instance.as_ref().unwrap();
            assert!(window[1].status.instances.iter().all(|i| &i.id != failed));
        }
    }

    #[test]
    fn test_clock_steps_once_per_cycle() {
        let mut sim = Simulation::new(SimulationConfig {
            cycles: 40,
            failure_probability: 0.0,
            seed: Some(3),
            cycle_interval: Duration::from_secs(45),
        });
        let mut asg = group(&sim);
        let report = sim.run(&mut asg).unwrap();

        assert_eq!(report.cycles.len(), 40);
        assert_eq!(sim.clock().now(), Duration::from_secs(39 * 45));
    }

    #[test]
    fn test_seeded_runs_match() {
        let run = |seed| {
            let mut sim = Simulation::new(SimulationConfig {
                failure_probability: 0.5,
                seed: Some(seed),
                ..Default::default()
            });
            let mut asg = group(&sim);
            let report = sim.run(&mut asg).unwrap();
            report
                .cycles
                .into_iter()
                .map(|c| c.failed_instance)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }
}
