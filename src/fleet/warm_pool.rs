//! Warm pool: a reserve of pre-built, stopped instances
//!
//! Activating a warm instance skips creation. Instances taken out of
//! service can be handed back and are stopped rather than terminated.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::instance::{Instance, InstanceRecord};
use super::template::LaunchTemplate;
use crate::network::SharedSecurityGroup;

/// Which reserve instances are handed out first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    #[default]
    OldestFirst,
    NewestFirst,
    Random,
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReusePolicy::OldestFirst => write!(f, "oldest_first"),
            ReusePolicy::NewestFirst => write!(f, "newest_first"),
            ReusePolicy::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmPoolState {
    Stopped,
    Initializing,
    Ready,
}

impl fmt::Display for WarmPoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarmPoolState::Stopped => write!(f, "stopped"),
            WarmPoolState::Initializing => write!(f, "initializing"),
            WarmPoolState::Ready => write!(f, "ready"),
        }
    }
}

/// Reserve of stopped instances owned by one group
#[derive(Debug, Clone)]
pub struct WarmPool {
    size: usize,
    min_size: usize,
    reuse_policy: ReusePolicy,
    instances: Vec<Instance>,
    state: WarmPoolState,
    rng: StdRng,
    /// Next suffix for `{group}-warm-instance-{n}`; never reused
    next_index: u64,
}

impl WarmPool {
    pub fn new(size: usize, min_size: usize, reuse_policy: ReusePolicy) -> Self {
        Self::with_rng(size, min_size, reuse_policy, StdRng::from_entropy())
    }

    /// Deterministic random reuse
    pub fn with_seed(size: usize, min_size: usize, reuse_policy: ReusePolicy, seed: u64) -> Self {
        Self::with_rng(size, min_size, reuse_policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(size: usize, min_size: usize, reuse_policy: ReusePolicy, rng: StdRng) -> Self {
        Self {
            size,
            min_size,
            reuse_policy,
            instances: Vec::new(),
            state: WarmPoolState::Stopped,
            rng,
            next_index: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn reuse_policy(&self) -> ReusePolicy {
        self.reuse_policy
    }

    pub fn state(&self) -> WarmPoolState {
        self.state
    }

    pub fn current_size(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.instances.len() < self.size
    }

    pub fn below_minimum(&self) -> bool {
        self.instances.len() < self.min_size
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(Instance::id)
    }

    /// Fill the reserve with `size` stopped instances and mark it ready
    pub fn initialize(&mut self, template: &LaunchTemplate, group_name: &str) {
        self.state = WarmPoolState::Initializing;
        info!(group = %group_name, size = self.size, "Initializing warm pool");

        for _ in 0..self.size {
            let instance = self.build_instance(template, group_name);
            self.instances.push(instance);
        }

        self.state = WarmPoolState::Ready;
    }

    /// Take up to `count` instances per the reuse policy and start them
    pub fn get_instances(&mut self, count: usize) -> Vec<Instance> {
        let count = count.min(self.instances.len());
        if count == 0 {
            return Vec::new();
        }

        let mut taken = match self.reuse_policy {
            ReusePolicy::OldestFirst => self.instances.drain(..count).collect(),
            ReusePolicy::NewestFirst => {
                let at = self.instances.len() - count;
                self.instances.split_off(at)
            }
            ReusePolicy::Random => {
                let mut picks = index::sample(&mut self.rng, self.instances.len(), count).into_vec();
                picks.sort_unstable_by(|a, b| b.cmp(a));
                let mut taken: Vec<Instance> =
                    picks.into_iter().map(|i| self.instances.remove(i)).collect();
                taken.reverse();
                taken
            }
        };

        for instance in &mut taken {
            instance.start();
        }
        debug!(count = taken.len(), remaining = self.instances.len(), "Handed out warm instances");
        taken
    }

    /// Stop and keep instances up to the pool's `size`.
    ///
    /// Anything that does not fit is returned untouched.
    pub fn add_instances(&mut self, instances: Vec<Instance>) -> Vec<Instance> {
        let mut overflow = Vec::new();
        for mut instance in instances {
            if self.has_capacity() {
                instance.stop();
                debug!(instance = %instance.id(), "Recycled into warm pool");
                self.instances.push(instance);
            } else {
                overflow.push(instance);
            }
        }
        overflow
    }

    /// Create fresh stopped instances until the reserve is back at `size`
    pub fn maintain_size(&mut self, template: &LaunchTemplate, group_name: &str) -> usize {
        let shortfall = self.size.saturating_sub(self.instances.len());
        for _ in 0..shortfall {
            let instance = self.build_instance(template, group_name);
            self.instances.push(instance);
        }
        if shortfall > 0 {
            info!(group = %group_name, created = shortfall, "Replenished warm pool");
        }
        shortfall
    }

    /// Terminate every reserve instance
    pub fn stop(&mut self) {
        for instance in &mut self.instances {
            instance.shutdown();
        }
        self.instances.clear();
        self.state = WarmPoolState::Stopped;
    }

    pub fn status(&self) -> WarmPoolStatus {
        WarmPoolStatus {
            state: self.state,
            size: self.size,
            current_size: self.instances.len(),
            min_size: self.min_size,
            reuse_policy: self.reuse_policy,
        }
    }

    fn build_instance(&mut self, template: &LaunchTemplate, group_name: &str) -> Instance {
        let id = format!("{}-warm-instance-{}", group_name, self.next_index);
        self.next_index += 1;
        template.create_instance(id)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn to_record(&self) -> WarmPoolRecord {
        WarmPoolRecord {
            size: self.size,
            min_size: self.min_size,
            reuse_policy: self.reuse_policy,
            state: self.state,
            next_index: self.next_index,
            instances: self.instances.iter().map(Instance::to_record).collect(),
        }
    }

    pub fn from_record(
        record: &WarmPoolRecord,
        lookup: &HashMap<String, SharedSecurityGroup>,
    ) -> Result<Self, String> {
        let mut pool = Self::new(record.size, record.min_size, record.reuse_policy);
        pool.state = record.state;
        pool.next_index = record.next_index.max(1);
        pool.instances = record
            .instances
            .iter()
            .map(|r| Instance::from_record(r, lookup))
            .collect::<Result<_, _>>()?;
        Ok(pool)
    }
}

/// Warm-pool part of a group status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolStatus {
    pub state: WarmPoolState,
    pub size: usize,
    pub current_size: usize,
    pub min_size: usize,
    pub reuse_policy: ReusePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmPoolRecord {
    pub size: usize,
    pub min_size: usize,
    pub reuse_policy: ReusePolicy,
    pub state: WarmPoolState,
    pub next_index: u64,
    pub instances: Vec<InstanceRecord>,
}
