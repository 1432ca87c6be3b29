//! FleetServer: owns the sockets and the four long-lived loops.
//!
//! [`FleetServer::start`] binds the telemetry socket (fatal on failure) and the
//! broadcast socket (non-fatal: the scheduler and global commands are disabled
//! but everything else runs), then spawns:
//! - telemetry ingest
//! - broadcast scheduler
//! - health monitor
//! - reaper
//!
//! All loops exit when [`FleetServer::stop`] fires the shutdown signal.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{info, warn};

use convoy_core::config::FleetConfig;
use convoy_core::error::FleetError;
use convoy_core::registry::FleetRegistry;
use convoy_core::topology::TopologyMatrix;

use crate::control::FleetControl;
use crate::ingest::TelemetryIngest;
use crate::monitor::{HealthMonitor, Reaper};
use crate::scheduler::{BroadcastScheduler, BroadcastSettings};
use crate::socket::DatagramSocket;
use crate::transport::{BroadcastTransport, UnicastTransport, resolve_broadcast_addr};

/// The fleet control plane.
pub struct FleetServer {
    config: FleetConfig,
    registry: Arc<FleetRegistry>,
    topology: Arc<RwLock<TopologyMatrix>>,
    settings: Arc<Mutex<BroadcastSettings>>,
    control: Option<FleetControl>,
    /// Actual telemetry address once bound.
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: bool,
}

impl FleetServer {
    /// Create a server from a validated config. Nothing is bound yet.
    pub fn new(config: FleetConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let settings = BroadcastSettings {
            enabled: config.broadcast_enabled,
            interval: config.broadcast_interval,
            group_size: config.broadcast_group_size,
        };
        Ok(Self {
            registry: Arc::new(FleetRegistry::new()),
            topology: Arc::new(RwLock::new(TopologyMatrix::from_config(&config.topology))),
            settings: Arc::new(Mutex::new(settings)),
            config,
            control: None,
            local_addr: None,
            shutdown_tx: None,
            running: false,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn registry(&self) -> Arc<FleetRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bound telemetry address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Control handle for the HTTP layer.
    pub fn control(&self) -> Result<FleetControl, FleetError> {
        self.control.clone().ok_or(FleetError::NotRunning)
    }

    /// Bind sockets and spawn every loop. Starting twice is a no-op.
    pub async fn start(&mut self) -> Result<(), FleetError> {
        if self.running {
            return Ok(());
        }

        let telemetry_addr = self.config.telemetry_addr;
        let telemetry = UdpSocket::bind(telemetry_addr)
            .await
            .map_err(|e| FleetError::Bind {
                addr: telemetry_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = telemetry.local_addr()?;
        let telemetry: Arc<dyn DatagramSocket> = Arc::new(telemetry);
        info!("Telemetry socket listening on {local_addr}");

        let target_ip = resolve_broadcast_addr(self.config.broadcast_addr).await;
        let target = SocketAddr::V4(SocketAddrV4::new(target_ip, self.config.broadcast_port));
        let broadcast_transport =
            match BroadcastTransport::bind(self.config.broadcast_bind_port, target).await {
                Ok(transport) => Some(Arc::new(transport)),
                Err(e) => {
                    warn!("Broadcast subsystem disabled: {e}");
                    None
                }
            };

        let unicast = Arc::new(UnicastTransport::new(
            Arc::clone(&telemetry),
            self.registry(),
            self.config.unicast_attempts,
            self.config.unicast_retry_delay,
        ));
        let scheduler = BroadcastScheduler::new(
            self.registry(),
            Arc::clone(&self.topology),
            Arc::clone(&self.settings),
            broadcast_transport.clone(),
            self.config.group_delay,
            self.config.freshness_window,
        );
        let control = FleetControl::new(
            &self.config,
            self.registry(),
            Arc::clone(&self.topology),
            Arc::clone(&self.settings),
            unicast,
            broadcast_transport,
        );

        let (shutdown_tx, _) = broadcast::channel(8);

        let ingest = TelemetryIngest::new(telemetry, self.registry(), scheduler.clone());
        tokio::spawn(ingest.run(shutdown_tx.subscribe()));

        tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

        let health = HealthMonitor::new(
            self.registry(),
            self.config.health_interval,
            self.config.liveness_timeout,
        );
        tokio::spawn(health.run(shutdown_tx.subscribe()));

        let reaper = Reaper::new(
            self.registry(),
            self.config.reap_interval,
            self.config.retention_timeout,
        );
        tokio::spawn(reaper.run(shutdown_tx.subscribe()));

        self.shutdown_tx = Some(shutdown_tx);
        self.control = Some(control);
        self.local_addr = Some(local_addr);
        self.running = true;
        info!("Fleet server started");
        Ok(())
    }

    /// Signal every loop to stop. In-flight reliable sends run to completion.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.control = None;
        self.local_addr = None;
        if self.running {
            self.running = false;
            info!("Fleet server stopped");
        }
    }
}

impl Drop for FleetServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
