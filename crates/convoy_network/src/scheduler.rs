//! Periodic telemetry rebroadcast.
//!
//! Each cycle snapshots the fresh, connected cars, applies the topology
//! filter, and sends the survivors in id-sorted groups of at most
//! `group_size` cars per frame.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use convoy_core::car::Car;
use convoy_core::error::FleetError;
use convoy_core::registry::FleetRegistry;
use convoy_core::topology::TopologyMatrix;
use convoy_core::wire::encode_frame;

use crate::transport::BroadcastTransport;

/// Shortest pause between two cycles.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Runtime-adjustable broadcast settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Whether periodic and off-cycle cycles run.
    pub enabled: bool,
    /// Target period of one cycle.
    pub interval: Duration,
    /// Maximum cars per frame.
    pub group_size: usize,
}

impl BroadcastSettings {
    pub fn set_interval(&mut self, interval: Duration) -> Result<(), FleetError> {
        if interval.is_zero() {
            return Err(FleetError::validation("broadcast interval must be > 0"));
        }
        self.interval = interval;
        Ok(())
    }

    pub fn set_group_size(&mut self, group_size: usize) -> Result<(), FleetError> {
        if group_size == 0 {
            return Err(FleetError::validation("broadcast group size must be > 0"));
        }
        self.group_size = group_size;
        Ok(())
    }
}

/// What one broadcast cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Cars that passed the freshness and topology filters.
    pub cars: usize,
    /// Frames built for those cars.
    pub frames: usize,
    /// Frames the socket accepted.
    pub frames_sent: usize,
}

/// Split id-sorted cars into consecutive groups of at most `size`.
pub fn split_into_groups(cars: &[Car], size: usize) -> Vec<&[Car]> {
    cars.chunks(size.max(1)).collect()
}

/// Broadcast loop state. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct BroadcastScheduler {
    registry: Arc<FleetRegistry>,
    topology: Arc<RwLock<TopologyMatrix>>,
    settings: Arc<Mutex<BroadcastSettings>>,
    transport: Option<Arc<BroadcastTransport>>,
    group_delay: Duration,
    freshness_window: Duration,
}

impl BroadcastScheduler {
    /// A `None` transport makes every cycle a no-op.
    pub fn new(
        registry: Arc<FleetRegistry>,
        topology: Arc<RwLock<TopologyMatrix>>,
        settings: Arc<Mutex<BroadcastSettings>>,
        transport: Option<Arc<BroadcastTransport>>,
        group_delay: Duration,
        freshness_window: Duration,
    ) -> Self {
        Self {
            registry,
            topology,
            settings,
            transport,
            group_delay,
            freshness_window,
        }
    }

    pub fn settings(&self) -> BroadcastSettings {
        *self.settings.lock()
    }

    /// Whether a broadcast socket is available.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Run one cycle now, regardless of the enable flag.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(transport) = &self.transport else {
            return CycleOutcome::default();
        };

        let fresh = self
            .registry
            .fresh_connected(Utc::now(), self.freshness_window);
        let mut cars = self.topology.read().filter(fresh);
        if cars.is_empty() {
            trace!("Broadcast cycle skipped: no eligible cars");
            return CycleOutcome::default();
        }
        cars.sort_by(|a, b| a.id.cmp(&b.id));

        let group_size = self.settings().group_size;
        let groups = split_into_groups(&cars, group_size);
        let mut outcome = CycleOutcome {
            cars: cars.len(),
            frames: groups.len(),
            frames_sent: 0,
        };

        for (i, group) in groups.iter().enumerate() {
            let frame = encode_frame(group);
            if transport.send_once(&frame).await {
                outcome.frames_sent += 1;
            }
            // Stamped whether or not the send succeeded.
            self.registry
                .mark_broadcast(group.iter().map(|car| car.id.as_str()), Utc::now());
            if i + 1 < groups.len() {
                tokio::time::sleep(self.group_delay).await;
            }
        }

        trace!(
            "Broadcast cycle: {} cars in {}/{} frames",
            outcome.cars, outcome.frames_sent, outcome.frames
        );
        outcome
    }

    /// Run one cycle if broadcasting is enabled.
    pub async fn tick(&self) -> Option<CycleOutcome> {
        if self.settings().enabled {
            Some(self.run_cycle().await)
        } else {
            None
        }
    }

    /// Spawn an immediate off-cycle broadcast.
    pub fn trigger(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Some(outcome) = scheduler.tick().await {
                debug!("Off-cycle broadcast sent {} frames", outcome.frames_sent);
            }
        });
    }

    /// Self-paced loop: each cycle sleeps for whatever remains of the
    /// interval, never less than [`MIN_SLEEP`].
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        debug!("Broadcast scheduler started");
        loop {
            let started = Instant::now();
            self.tick().await;

            let interval = self.settings().interval;
            let pause = interval.saturating_sub(started.elapsed()).max(MIN_SLEEP);

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.recv() => {
                    debug!("Broadcast scheduler shutting down");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
