//! Convoy core: fleet state and wire vocabulary for the car control plane.
//!
//! Everything in this crate is free of sockets and tasks:
//!
//! - **Registry**: the single lock-guarded store of per-car state.
//! - **Wire**: telemetry decoding, broadcast frames and command strings.
//! - **Topology**: the 4×4 visibility matrix that filters broadcast traffic.
//! - **Formation**: offsets, presets and the leader/follower state.
//!
//! The `convoy_network` crate drives these types from UDP sockets.

pub mod car;
pub mod config;
pub mod error;
pub mod formation;
pub mod logging;
pub mod registry;
pub mod topology;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use car::{Car, Position, Velocity};
pub use config::FleetConfig;
pub use error::FleetError;
pub use formation::{CustomEncoding, FormationState, Offset, OffsetMap};
pub use registry::{FleetRegistry, UpsertEvent};
pub use topology::{Matrix, TopologyConfig, TopologyMatrix};
pub use wire::{Command, Telemetry, TelemetryPacket, WireError};
