//! Background control loop
//!
//! Every tick runs one reconcile pass over each group. With a state store
//! configured, the fleet is saved every `save_every` ticks and once more on
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::controller::FleetController;
use crate::config::ReconcilerSpec;
use crate::store::StateStore;

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub tick: Duration,
    /// Save every N ticks; 0 saves only on shutdown
    pub save_every: u32,
    pub store: Option<StateStore>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_spec(&ReconcilerSpec::default())
    }
}

impl ReconcilerConfig {
    pub fn from_spec(spec: &ReconcilerSpec) -> Self {
        Self {
            tick: Duration::from_secs(spec.tick_secs.max(1)),
            save_every: spec.save_every,
            store: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }
}

/// Spawn the reconciler as a background task
pub fn spawn_reconciler(
    controller: Arc<FleetController>,
    config: ReconcilerConfig,
) -> watch::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        let mut ticker = interval(config.tick);
        let mut ticks: u64 = 0;

        info!("Reconciler started, ticking every {:?}", config.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    reconcile_tick(&controller);
                    ticks += 1;
                    if config.save_every > 0 && ticks % u64::from(config.save_every) == 0 {
                        save_state(&controller, config.store.as_ref());
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Reconciler shutting down");
                    save_state(&controller, config.store.as_ref());
                    break;
                }
            }
        }
    });

    shutdown_tx
}

fn reconcile_tick(controller: &FleetController) {
    for (group, outcome) in controller.reconcile_all() {
        if !outcome.activity.is_empty() || !outcome.replacements.is_empty() {
            info!(
                %group,
                added = outcome.activity.added.len(),
                removed = outcome.activity.removed.len(),
                replaced = outcome.replacements.len(),
                "Reconciled group"
            );
        } else {
            debug!(%group, health_checked = outcome.health_checked, "Group steady");
        }
        if outcome.warm_instances_created > 0 {
            debug!(%group, created = outcome.warm_instances_created, "Warm pool replenished");
        }
    }
}

fn save_state(controller: &FleetController, store: Option<&StateStore>) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.save(&controller.snapshot()) {
        error!(path = %store.path().display(), "Failed to save fleet state: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Manifest;
    use crate::fleet::ManualClock;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_spec() {
        let config = ReconcilerConfig::from_spec(&ReconcilerSpec {
            tick_secs: 0,
            save_every: 3,
        });
        assert_eq!(config.tick, Duration::from_secs(1));
        assert_eq!(config.save_every, 3);
        assert!(config.store.is_none());
        assert_eq!(ReconcilerConfig::default().tick, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_reconciler_scales_and_saves_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let controller = Arc::new(
            FleetController::from_manifest(&Manifest::demo(), Arc::new(ManualClock::new())).unwrap(),
        );
        controller.start_all().unwrap();
        controller.simulate_traffic("web-servers-standard", 90.0).unwrap();

        let config = ReconcilerConfig {
            tick: Duration::from_millis(10),
            save_every: 0,
            store: Some(store.clone()),
        };
        let shutdown = spawn_reconciler(controller.clone(), config);

        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            controller.group_status("web-servers-standard").unwrap().current_size,
            3
        );

        shutdown.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.groups.len(), 2);
    }
}
