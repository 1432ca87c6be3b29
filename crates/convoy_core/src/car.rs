//! Car records: one entry per fleet member.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::Telemetry;

/// Planar position in the arena frame (metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Metres along the arena x axis.
    pub x: f64,
    /// Metres along the arena y axis.
    pub y: f64,
}

/// Velocity as reported by the car (m/s).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    /// Vertical component. Ignored for speed.
    pub vz: f64,
}

impl Velocity {
    /// Planar speed, `sqrt(vx² + vy²)`.
    pub fn planar_speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }
}

/// State of one car as last reported over telemetry.
///
/// Serialize-only: `speed` is always derived from `velocity`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Car {
    /// Identifier reported by the firmware, e.g. `CAR1`.
    pub id: String,
    /// Address the last telemetry datagram came from.
    pub address: SocketAddr,
    /// Last reported position.
    pub position: Position,
    /// Heading in degrees.
    pub heading: f64,
    /// Battery voltage.
    pub battery: f64,
    /// Last reported velocity.
    pub velocity: Velocity,
    /// Cached planar speed of `velocity`.
    speed: f64,
    /// Whether the car is considered live.
    pub connected: bool,
    /// When the last valid telemetry was received.
    pub last_update: DateTime<Utc>,
    /// Number of telemetry updates applied since creation.
    pub update_count: u64,
    /// Failed delivery attempts since the last (re)connection.
    pub connection_attempts: u32,
    /// When this car's state was last included in a broadcast frame.
    pub last_broadcast: Option<DateTime<Utc>>,
}

impl Car {
    /// Create a connected car from its first telemetry packet.
    pub fn new(id: String, address: SocketAddr, telemetry: Telemetry, now: DateTime<Utc>) -> Self {
        let mut car = Self {
            id,
            address,
            position: Position::default(),
            heading: 0.0,
            battery: 0.0,
            velocity: Velocity::default(),
            speed: 0.0,
            connected: true,
            last_update: now,
            update_count: 0,
            connection_attempts: 0,
            last_broadcast: None,
        };
        car.apply(&telemetry);
        car
    }

    /// Overwrite pose, battery and velocity; speed is recomputed.
    pub fn apply(&mut self, telemetry: &Telemetry) {
        self.position = Position {
            x: telemetry.x,
            y: telemetry.y,
        };
        self.heading = telemetry.yaw;
        self.battery = telemetry.voltage;
        self.velocity = Velocity {
            vx: telemetry.vx,
            vy: telemetry.vy,
            vz: telemetry.vz,
        };
        self.speed = self.velocity.planar_speed();
    }

    /// Planar speed derived from the last velocity report.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Record a telemetry timestamp. Never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Time since the last telemetry, measured at `now`.
    pub fn silence(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_update)
    }
}
