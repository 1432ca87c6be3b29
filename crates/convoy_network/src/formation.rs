//! Formation control: leader/follower command sequences over reliable unicast.
//!
//! Per car the start command must be delivered before the role command is
//! attempted. Cars are processed sequentially in id order; a failure on one
//! car never stops the others and only shows up in the returned counts.
//!
//! Entry points that send commands run one at a time, so the recorded state
//! always belongs to the operation whose commands the cars saw last.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use convoy_core::error::FleetError;
use convoy_core::formation::{
    CustomEncoding, FALLBACK_FORMATION, FormationState, Offset, OffsetMap,
};
use convoy_core::registry::FleetRegistry;
use convoy_core::wire::Command;

use crate::transport::UnicastTransport;

/// Formation type recorded for caller-supplied offsets.
pub const CUSTOM_FORMATION: &str = "custom";

/// Attempted vs. delivered counts for a multi-car operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Cars a command sequence was sent to.
    pub attempted: usize,
    /// Cars that received the whole sequence.
    pub succeeded: usize,
    /// `succeeded / attempted` as a percentage with one decimal, e.g. `"66.7%"`.
    pub success_rate: String,
}

impl DeliveryReport {
    /// Build a report and format its success rate.
    pub fn new(attempted: usize, succeeded: usize) -> Self {
        let rate = if attempted > 0 {
            succeeded as f64 / attempted as f64 * 100.0
        } else {
            0.0
        };
        Self {
            attempted,
            succeeded,
            success_rate: format!("{rate:.1}%"),
        }
    }
}

/// Outcome of starting a preset or custom formation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormationReport {
    pub leader: String,
    pub formation_type: String,
    /// Offsets the followers were given.
    pub offsets: OffsetMap,
    pub delivery: DeliveryReport,
    /// Whether a different, still connected previous leader was re-sent a
    /// follower role.
    pub previous_leader_converted: bool,
}

/// Owns the formation state and issues every formation command.
pub struct FormationCoordinator {
    registry: Arc<FleetRegistry>,
    unicast: Arc<UnicastTransport>,
    presets: BTreeMap<String, OffsetMap>,
    encoding: CustomEncoding,
    state: Mutex<FormationState>,
    /// Held across a whole command sequence. `state` is only locked briefly.
    operation: AsyncMutex<()>,
}

impl FormationCoordinator {
    /// Idle coordinator sending through `unicast`.
    pub fn new(
        registry: Arc<FleetRegistry>,
        unicast: Arc<UnicastTransport>,
        presets: BTreeMap<String, OffsetMap>,
        encoding: CustomEncoding,
    ) -> Self {
        Self {
            registry,
            unicast,
            presets,
            encoding,
            state: Mutex::new(FormationState::default()),
            operation: AsyncMutex::new(()),
        }
    }

    pub fn status(&self) -> FormationState {
        self.state.lock().clone()
    }

    pub fn presets(&self) -> &BTreeMap<String, OffsetMap> {
        &self.presets
    }

    /// Offsets for a formation type; unknown types use the fallback preset.
    pub fn offsets_for(&self, formation_type: &str) -> OffsetMap {
        self.presets
            .get(formation_type)
            .or_else(|| self.presets.get(FALLBACK_FORMATION))
            .cloned()
            .unwrap_or_default()
    }

    /// Start a preset formation led by `leader`.
    pub async fn start(
        &self,
        leader: &str,
        formation_type: &str,
    ) -> Result<FormationReport, FleetError> {
        let _operation = self.operation.lock().await;
        self.require_leader(leader)?;

        let offsets = self.offsets_for(formation_type);
        if !self.presets.contains_key(formation_type) {
            warn!("Unknown formation '{formation_type}', using {FALLBACK_FORMATION} offsets");
        }

        let previous = self.activate(leader, formation_type);
        info!("Starting formation '{formation_type}' led by {leader}");

        let start = Command::FormationStart {
            leader: leader.to_string(),
            formation_type: formation_type.to_string(),
        };
        let delivery = self
            .dispatch(&start, |car_id| {
                if car_id == leader {
                    Command::AssignLeader {
                        car_id: car_id.to_string(),
                    }
                } else {
                    Command::AssignFollower {
                        leader: leader.to_string(),
                        offset: offset_of(&offsets, car_id),
                    }
                }
            })
            .await;

        let mut previous_leader_converted = false;
        if let Some(previous) = previous.filter(|p| p != leader) {
            if self.registry.is_connected(&previous) {
                let follower = Command::AssignFollower {
                    leader: leader.to_string(),
                    offset: offset_of(&offsets, &previous),
                };
                previous_leader_converted = self.start_then_role(&previous, &start, &follower).await;
                if previous_leader_converted {
                    info!("Previous leader {previous} converted to follower");
                }
            }
        }

        Ok(FormationReport {
            leader: leader.to_string(),
            formation_type: formation_type.to_string(),
            offsets,
            delivery,
            previous_leader_converted,
        })
    }

    /// Start a formation with caller-supplied offsets.
    pub async fn set_custom(
        &self,
        leader: &str,
        offsets: OffsetMap,
    ) -> Result<FormationReport, FleetError> {
        let _operation = self.operation.lock().await;
        if offsets.is_empty() {
            return Err(FleetError::validation("custom formation needs offsets"));
        }
        self.require_leader(leader)?;

        self.activate(leader, CUSTOM_FORMATION);
        info!("Starting custom formation led by {leader} ({} offsets)", offsets.len());

        let encoding = self.encoding;
        let start = match encoding {
            CustomEncoding::Legacy => Command::LegacyCustomStart {
                leader: leader.to_string(),
            },
            CustomEncoding::Bracketed => Command::FormationStart {
                leader: leader.to_string(),
                formation_type: CUSTOM_FORMATION.to_string(),
            },
        };
        let delivery = self
            .dispatch(&start, |car_id| {
                let offset = offset_of(&offsets, car_id);
                match (encoding, car_id == leader) {
                    (CustomEncoding::Legacy, true) => Command::LegacyCustomLeader,
                    (CustomEncoding::Legacy, false) => Command::LegacyCustomFollower {
                        leader: leader.to_string(),
                        offset,
                    },
                    (CustomEncoding::Bracketed, true) => Command::AssignLeader {
                        car_id: car_id.to_string(),
                    },
                    (CustomEncoding::Bracketed, false) => Command::AssignFollower {
                        leader: leader.to_string(),
                        offset,
                    },
                }
            })
            .await;

        Ok(FormationReport {
            leader: leader.to_string(),
            formation_type: CUSTOM_FORMATION.to_string(),
            offsets,
            delivery,
            previous_leader_converted: false,
        })
    }

    /// Stop formation control on every connected car.
    pub async fn stop(&self) -> DeliveryReport {
        let _operation = self.operation.lock().await;
        let cars = self.registry.connected_ids();
        let stop = Command::FormationStop.to_string();

        let mut succeeded = 0;
        for car_id in &cars {
            if self.unicast.send_reliable(car_id, &stop).await {
                succeeded += 1;
            }
        }
        self.state.lock().enabled = false;

        let report = DeliveryReport::new(cars.len(), succeeded);
        info!("Formation stopped: {}/{} cars acknowledged", succeeded, cars.len());
        report
    }

    /// Push new offsets to followers of the running formation.
    pub async fn update_offsets(&self, offsets: &OffsetMap) -> Result<DeliveryReport, FleetError> {
        let _operation = self.operation.lock().await;
        let Some(leader) = self.status().active_leader().map(str::to_string) else {
            return Err(FleetError::FormationInactive);
        };
        if offsets.is_empty() {
            return Err(FleetError::validation("no offsets to update"));
        }

        let mut attempted = 0;
        let mut succeeded = 0;
        for (car_id, offset) in offsets {
            if *car_id == leader || !self.registry.is_connected(car_id) {
                continue;
            }
            attempted += 1;
            let update = Command::OffsetUpdate {
                leader: leader.clone(),
                offset: *offset,
            };
            if self.unicast.send_reliable(car_id, &update.to_string()).await {
                debug!("Offset update delivered to {car_id}: {update}");
                succeeded += 1;
            }
        }
        Ok(DeliveryReport::new(attempted, succeeded))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require_leader(&self, leader: &str) -> Result<(), FleetError> {
        if leader.is_empty() {
            return Err(FleetError::validation("a leader must be specified"));
        }
        self.registry.deliverable_address(leader).map(|_| ())
    }

    /// Mark the formation active and return the leader it replaces.
    fn activate(&self, leader: &str, formation_type: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.enabled = true;
        state.formation_type = formation_type.to_string();
        state.leader.replace(leader.to_string())
    }

    /// Send `start` then the car's role command to every connected car.
    async fn dispatch<F>(&self, start: &Command, role_for: F) -> DeliveryReport
    where
        F: Fn(&str) -> Command,
    {
        let cars = self.registry.connected_ids();
        let mut succeeded = 0;
        for car_id in &cars {
            let role = role_for(car_id);
            if self.start_then_role(car_id, start, &role).await {
                succeeded += 1;
            }
        }
        DeliveryReport::new(cars.len(), succeeded)
    }

    async fn start_then_role(&self, car_id: &str, start: &Command, role: &Command) -> bool {
        if !self.unicast.send_reliable(car_id, &start.to_string()).await {
            return false;
        }
        let delivered = self.unicast.send_reliable(car_id, &role.to_string()).await;
        if delivered {
            debug!("{car_id}: {start} then {role}");
        }
        delivered
    }
}

fn offset_of(offsets: &OffsetMap, car_id: &str) -> Offset {
    offsets.get(car_id).copied().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
