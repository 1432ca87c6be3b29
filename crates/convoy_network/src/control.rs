//! Control surface for an external HTTP layer.
//!
//! [`FleetControl`] exposes every operator action as a typed call returning a
//! serializable payload. Rejected requests come back as
//! [`FleetError`]s for which `is_validation()` holds, and leave state untouched.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use convoy_core::car::Car;
use convoy_core::config::FleetConfig;
use convoy_core::error::FleetError;
use convoy_core::formation::{FormationState, OffsetMap};
use convoy_core::registry::FleetRegistry;
use convoy_core::topology::{Matrix, TopologyMatrix, parse_matrix};
use convoy_core::wire::{Command, flatten_matrix};

use crate::formation::{DeliveryReport, FormationCoordinator, FormationReport};
use crate::scheduler::BroadcastSettings;
use crate::transport::{BroadcastTransport, UnicastTransport};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Formation status as reported to operators.
pub type FormationStatus = FormationState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastSettingsView {
    pub enabled: bool,
    pub interval_ms: u64,
    pub group_size: usize,
    /// `None` when the broadcast socket could not be bound.
    pub target: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Every known car, ordered by id.
    pub cars: Vec<Car>,
    pub total: usize,
    pub connected: usize,
    pub broadcast: BroadcastSettingsView,
    pub topology_enabled: bool,
    pub formation: FormationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyStatus {
    pub matrix: Matrix,
    pub enabled: bool,
    /// Row-major cells as carried by `[T,M,...]`.
    pub topology_string: String,
    /// Whether the matching global command went out at least once.
    /// Absent for plain queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibleCars {
    pub car_id: String,
    pub visible_cars: Vec<String>,
    pub topology_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationReport {
    pub car_id: String,
    pub command: String,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// FleetControl
// ---------------------------------------------------------------------------

/// Handle to a running fleet server. Cheap to clone.
#[derive(Clone)]
pub struct FleetControl {
    registry: Arc<FleetRegistry>,
    topology: Arc<RwLock<TopologyMatrix>>,
    settings: Arc<Mutex<BroadcastSettings>>,
    unicast: Arc<UnicastTransport>,
    broadcast: Option<Arc<BroadcastTransport>>,
    formation: Arc<FormationCoordinator>,
    command_repeats: u32,
    command_delay: Duration,
}

impl FleetControl {
    /// Wire a control handle over the server's shared state.
    pub fn new(
        config: &FleetConfig,
        registry: Arc<FleetRegistry>,
        topology: Arc<RwLock<TopologyMatrix>>,
        settings: Arc<Mutex<BroadcastSettings>>,
        unicast: Arc<UnicastTransport>,
        broadcast: Option<Arc<BroadcastTransport>>,
    ) -> Self {
        let formation = Arc::new(FormationCoordinator::new(
            registry.clone(),
            unicast.clone(),
            config.formation_presets.clone(),
            config.custom_formation_encoding,
        ));
        Self {
            registry,
            topology,
            settings,
            unicast,
            broadcast,
            formation,
            command_repeats: config.broadcast_command_repeats,
            command_delay: config.broadcast_command_delay,
        }
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    /// Consistent view of the whole fleet.
    pub fn snapshot(&self) -> FleetSnapshot {
        let cars = self.registry.all();
        let connected = cars.iter().filter(|car| car.connected).count();
        FleetSnapshot {
            taken_at: Utc::now(),
            total: cars.len(),
            connected,
            cars,
            broadcast: self.broadcast_settings(),
            topology_enabled: self.topology.read().is_enabled(),
            formation: self.formation.status(),
        }
    }

    // -- Broadcast settings -------------------------------------------------

    pub fn broadcast_settings(&self) -> BroadcastSettingsView {
        let settings = *self.settings.lock();
        BroadcastSettingsView {
            enabled: settings.enabled,
            interval_ms: settings.interval.as_millis() as u64,
            group_size: settings.group_size,
            target: self.broadcast.as_ref().map(|b| b.target()),
        }
    }

    pub fn set_broadcast_enabled(&self, enabled: bool) -> BroadcastSettingsView {
        self.settings.lock().enabled = enabled;
        info!("Periodic broadcast {}", if enabled { "enabled" } else { "disabled" });
        self.broadcast_settings()
    }

    pub fn set_broadcast_interval(
        &self,
        interval: Duration,
    ) -> Result<BroadcastSettingsView, FleetError> {
        self.settings.lock().set_interval(interval)?;
        info!("Broadcast interval set to {interval:?}");
        Ok(self.broadcast_settings())
    }

    pub fn set_broadcast_group_size(
        &self,
        group_size: usize,
    ) -> Result<BroadcastSettingsView, FleetError> {
        self.settings.lock().set_group_size(group_size)?;
        info!("Broadcast group size set to {group_size}");
        Ok(self.broadcast_settings())
    }

    // -- Navigation ---------------------------------------------------------

    /// Send an absolute navigation target to one car.
    pub async fn navigate(
        &self,
        car_id: &str,
        x: f64,
        y: f64,
        heading: f64,
    ) -> Result<NavigationReport, FleetError> {
        if !(x.is_finite() && y.is_finite() && heading.is_finite()) {
            return Err(FleetError::validation("navigation target must be finite"));
        }
        self.registry.deliverable_address(car_id)?;

        let command = Command::Navigate {
            car_id: car_id.to_string(),
            x,
            y,
            heading,
        }
        .to_string();
        let outcome = self
            .unicast
            .send_reliable_with(car_id, &command, self.unicast.max_attempts())
            .await;
        if !outcome.succeeded {
            return Err(FleetError::Transport(format!(
                "navigation command to {car_id} not delivered"
            )));
        }
        Ok(NavigationReport {
            car_id: car_id.to_string(),
            command,
            attempts: outcome.attempts,
        })
    }

    // -- Topology -----------------------------------------------------------

    pub fn topology_status(&self) -> TopologyStatus {
        let config = self.topology.read().config();
        TopologyStatus {
            topology_string: flatten_matrix(&config.matrix),
            matrix: config.matrix,
            enabled: config.enabled,
            broadcast_success: None,
        }
    }

    /// Install a new matrix and announce it to the fleet.
    pub async fn set_topology(
        &self,
        rows: &[Vec<i64>],
        enabled: bool,
    ) -> Result<TopologyStatus, FleetError> {
        let matrix = parse_matrix(rows)?;
        self.topology.write().set(matrix, enabled);
        info!("Topology updated (enabled: {enabled})");

        let sent = self
            .broadcast_global(&Command::TopologySet(matrix).to_string())
            .await;
        Ok(TopologyStatus {
            broadcast_success: Some(sent),
            ..self.topology_status()
        })
    }

    pub async fn set_topology_enabled(&self, enabled: bool) -> TopologyStatus {
        self.topology.write().set_enabled(enabled);
        info!("Topology filtering {}", if enabled { "enabled" } else { "disabled" });

        let sent = self
            .broadcast_global(&Command::TopologyEnable(enabled).to_string())
            .await;
        TopologyStatus {
            broadcast_success: Some(sent),
            ..self.topology_status()
        }
    }

    pub fn visible_cars(&self, car_id: &str) -> VisibleCars {
        let topology = self.topology.read();
        VisibleCars {
            car_id: car_id.to_string(),
            visible_cars: topology.visible_cars(car_id),
            topology_enabled: topology.is_enabled(),
        }
    }

    // -- Formation ----------------------------------------------------------

    pub async fn start_formation(
        &self,
        leader: &str,
        formation_type: &str,
    ) -> Result<FormationReport, FleetError> {
        self.formation.start(leader, formation_type).await
    }

    pub async fn stop_formation(&self) -> DeliveryReport {
        self.formation.stop().await
    }

    pub async fn set_custom_formation(
        &self,
        leader: &str,
        offsets: OffsetMap,
    ) -> Result<FormationReport, FleetError> {
        self.formation.set_custom(leader, offsets).await
    }

    pub async fn update_formation_offsets(
        &self,
        offsets: &OffsetMap,
    ) -> Result<DeliveryReport, FleetError> {
        self.formation.update_offsets(offsets).await
    }

    pub fn formation_status(&self) -> FormationStatus {
        self.formation.status()
    }

    pub fn formation_presets(&self) -> BTreeMap<String, OffsetMap> {
        self.formation.presets().clone()
    }

    async fn broadcast_global(&self, message: &str) -> bool {
        match &self.broadcast {
            Some(transport) => {
                transport
                    .send_reliable(message, self.command_repeats, self.command_delay)
                    .await
            }
            None => {
                warn!("No broadcast socket, dropped global command {message}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::ScriptedSocket;
    use convoy_core::formation::Offset;
    use convoy_core::topology::DEFAULT_MATRIX;
    use convoy_core::wire::Telemetry;

    struct Harness {
        control: FleetControl,
        unicast_socket: Arc<ScriptedSocket>,
        broadcast_socket: Arc<ScriptedSocket>,
    }

    fn harness(with_broadcast: bool) -> Harness {
        let config = FleetConfig {
            unicast_retry_delay: Duration::ZERO,
            broadcast_command_delay: Duration::ZERO,
            ..FleetConfig::default()
        };
        let registry = Arc::new(FleetRegistry::new());
        let unicast_socket = Arc::new(ScriptedSocket::default());
        let broadcast_socket = Arc::new(ScriptedSocket::default());
        let unicast = Arc::new(UnicastTransport::new(
            unicast_socket.clone(),
            registry.clone(),
            config.unicast_attempts,
            config.unicast_retry_delay,
        ));
        let broadcast = with_broadcast.then(|| {
            Arc::new(BroadcastTransport::new(
                broadcast_socket.clone(),
                SocketAddr::from(([127, 0, 0, 1], 8081)),
            ))
        });
        let settings = Arc::new(Mutex::new(BroadcastSettings {
            enabled: config.broadcast_enabled,
            interval: config.broadcast_interval,
            group_size: config.broadcast_group_size,
        }));
        let control = FleetControl::new(
            &config,
            registry,
            Arc::new(RwLock::new(TopologyMatrix::from_config(&config.topology))),
            settings,
            unicast,
            broadcast,
        );
        Harness {
            control,
            unicast_socket,
            broadcast_socket,
        }
    }

    fn connect(control: &FleetControl, id: &str) {
        control.registry().upsert(
            id,
            SocketAddr::from(([127, 0, 0, 1], 7100)),
            Telemetry::default(),
        );
    }

    #[test]
    fn test_snapshot_counts() {
        let h = harness(true);
        connect(&h.control, "CAR2");
        connect(&h.control, "CAR1");
        h.control.registry().set_connected("CAR2", false);

        let snapshot = h.control.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.connected, 1);
        assert_eq!(snapshot.cars[0].id, "CAR1");
        assert!(!snapshot.broadcast.enabled);
        assert!(!snapshot.formation.enabled);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cars"][0]["speed"], 0.0);
        assert_eq!(json["broadcast"]["interval_ms"], 70);
    }

    #[test]
    fn test_broadcast_settings_validation() {
        let h = harness(true);
        assert!(h.control.set_broadcast_enabled(true).enabled);

        let view = h.control.set_broadcast_interval(Duration::from_millis(100)).unwrap();
        assert_eq!(view.interval_ms, 100);
        assert!(h.control.set_broadcast_interval(Duration::ZERO).unwrap_err().is_validation());

        assert_eq!(h.control.set_broadcast_group_size(2).unwrap().group_size, 2);
        assert!(h.control.set_broadcast_group_size(0).is_err());
        assert_eq!(h.control.broadcast_settings().group_size, 2);
    }

    #[tokio::test]
    async fn test_navigate_formats_command() {
        let h = harness(true);
        connect(&h.control, "CAR1");

        let report = h.control.navigate("CAR1", 1.5, 2.346, 45.0).await.unwrap();
        assert_eq!(report.command, "[C,CAR1,1.50,2.35,45.0]");
        assert_eq!(report.attempts, 1);
        assert_eq!(h.unicast_socket.sent(), vec!["[C,CAR1,1.50,2.35,45.0]\n"]);
    }

    #[tokio::test]
    async fn test_navigate_rejects_unknown_car() {
        let h = harness(true);
        let err = h.control.navigate("CAR3", 0.0, 0.0, 0.0).await.unwrap_err();
        assert!(err.is_validation());
        assert!(h.control.navigate("CAR3", f64::NAN, 0.0, 0.0).await.is_err());
        assert!(h.unicast_socket.sent().is_empty());
    }

    #[tokio::test]
    async fn test_set_topology_broadcasts_matrix() {
        let h = harness(true);
        let rows = vec![vec![0, 1, 0, 0], vec![0; 4], vec![0; 4], vec![0; 4]];

        let status = h.control.set_topology(&rows, true).await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.broadcast_success, Some(true));
        assert_eq!(status.topology_string, "0,1,0,0,0,0,0,0,0,0,0,0,0,0,0,0");

        let sent = h.broadcast_socket.sent();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0], "[T,M,0,1,0,0,0,0,0,0,0,0,0,0,0,0,0,0]");

        assert_eq!(h.control.visible_cars("CAR2").visible_cars, vec!["CAR1"]);
    }

    #[tokio::test]
    async fn test_invalid_topology_leaves_state_untouched() {
        let h = harness(true);
        let rows = vec![vec![0, 1, 0], vec![0; 4], vec![0; 4], vec![0; 4]];

        assert!(h.control.set_topology(&rows, true).await.unwrap_err().is_validation());
        let status = h.control.topology_status();
        assert_eq!(status.matrix, DEFAULT_MATRIX);
        assert!(!status.enabled);
        assert!(h.broadcast_socket.sent().is_empty());
    }

    #[tokio::test]
    async fn test_topology_toggle() {
        let h = harness(true);
        let status = h.control.set_topology_enabled(true).await;
        assert!(status.enabled);
        assert_eq!(h.broadcast_socket.sent()[0], "[T,E,1]");

        let visible = h.control.visible_cars("CAR1");
        assert!(visible.topology_enabled);
        assert!(visible.visible_cars.is_empty());

        h.control.set_topology_enabled(false).await;
        assert_eq!(h.control.visible_cars("CAR1").visible_cars.len(), 4);
    }

    #[tokio::test]
    async fn test_topology_without_broadcast_socket() {
        let h = harness(false);
        let status = h.control.set_topology_enabled(true).await;
        assert!(status.enabled);
        assert_eq!(status.broadcast_success, Some(false));
        assert!(h.control.broadcast_settings().target.is_none());
    }

    #[tokio::test]
    async fn test_formation_round_trip_through_control() {
        let h = harness(true);
        connect(&h.control, "CAR1");

        let report = h.control.start_formation("CAR1", "square").await.unwrap();
        assert_eq!(report.delivery.succeeded, 1);
        assert!(h.control.formation_status().enabled);

        let offsets = OffsetMap::from([("CAR1".to_string(), Offset::new(0.1, 0.0, 0.0))]);
        let update = h.control.update_formation_offsets(&offsets).await.unwrap();
        assert_eq!(update.attempted, 0);

        h.control.stop_formation().await;
        assert!(!h.control.formation_status().enabled);
        assert_eq!(h.control.formation_presets().len(), 3);
    }
}
