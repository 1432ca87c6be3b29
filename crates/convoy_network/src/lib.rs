//! Convoy network: UDP transport and fleet coordination loops.
//!
//! [`FleetServer`] binds the sockets and runs the long-lived tasks;
//! [`FleetControl`] is the handle an HTTP layer uses to drive the fleet.

pub mod control;
pub mod formation;
pub mod ingest;
pub mod monitor;
pub mod scheduler;
pub mod server;
pub mod socket;
pub mod transport;

pub use control::{
    BroadcastSettingsView, FleetControl, FleetSnapshot, FormationStatus, NavigationReport,
    TopologyStatus, VisibleCars,
};
pub use formation::{DeliveryReport, FormationCoordinator, FormationReport};
pub use scheduler::{BroadcastScheduler, BroadcastSettings, CycleOutcome};
pub use server::FleetServer;
pub use socket::DatagramSocket;
pub use transport::{BroadcastTransport, RetryOutcome, UnicastTransport};
