//! Fleet registry: the single shared store of car state.
//!
//! Every read, write and iteration goes through one mutex. Methods hold the
//! lock only for their own duration and hand out clones, so no caller ever
//! performs network I/O while the registry is locked.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::car::Car;
use crate::error::FleetError;
use crate::wire::Telemetry;

/// What an [`FleetRegistry::upsert`] did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertEvent {
    /// First packet from this identifier; a new car was created.
    Created,
    /// Known car that changed address or came back from disconnected.
    Reconnected,
    /// Routine telemetry update.
    Updated,
}

impl UpsertEvent {
    /// Whether the car should receive a reconnect acknowledgment.
    pub fn is_reconnection(self) -> bool {
        matches!(self, Self::Created | Self::Reconnected)
    }
}

/// Concurrent map from car identifier to [`Car`].
///
/// Iteration order is the identifier order, which keeps broadcast grouping and
/// formation dispatch deterministic.
#[derive(Debug, Default)]
pub struct FleetRegistry {
    cars: Mutex<BTreeMap<String, Car>>,
}

impl FleetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one telemetry packet received now.
    pub fn upsert(&self, id: &str, addr: SocketAddr, telemetry: Telemetry) -> UpsertEvent {
        self.upsert_at(id, addr, telemetry, Utc::now())
    }

    /// Apply one telemetry packet received at `now`.
    pub fn upsert_at(
        &self,
        id: &str,
        addr: SocketAddr,
        telemetry: Telemetry,
        now: DateTime<Utc>,
    ) -> UpsertEvent {
        let mut cars = self.cars.lock();

        let Some(car) = cars.get_mut(id) else {
            cars.insert(id.to_string(), Car::new(id.to_string(), addr, telemetry, now));
            info!("New car {id} connected from {addr}");
            return UpsertEvent::Created;
        };

        let mut reconnected = false;
        if car.address != addr {
            info!("Car {id} moved from {} to {addr}", car.address);
            car.address = addr;
            reconnected = true;
        }
        if !car.connected {
            info!("Car {id} reconnected from {addr}");
            car.connected = true;
            reconnected = true;
        }
        if reconnected {
            car.connection_attempts = 0;
        }

        car.apply(&telemetry);
        car.touch(now);
        car.update_count += 1;

        if reconnected {
            UpsertEvent::Reconnected
        } else {
            UpsertEvent::Updated
        }
    }

    /// Get a copy of one car.
    pub fn get(&self, id: &str) -> Option<Car> {
        self.cars.lock().get(id).cloned()
    }

    /// Consistent snapshot of every car, ordered by identifier.
    pub fn all(&self) -> Vec<Car> {
        self.cars.lock().values().cloned().collect()
    }

    /// Identifiers of connected cars, ordered.
    pub fn connected_ids(&self) -> Vec<String> {
        self.cars
            .lock()
            .values()
            .filter(|car| car.connected)
            .map(|car| car.id.clone())
            .collect()
    }

    /// Whether the car exists and is connected.
    pub fn is_connected(&self, id: &str) -> bool {
        self.cars.lock().get(id).is_some_and(|car| car.connected)
    }

    /// Set the connected flag. Returns `false` if the car is unknown.
    pub fn set_connected(&self, id: &str, connected: bool) -> bool {
        match self.cars.lock().get_mut(id) {
            Some(car) => {
                car.connected = connected;
                true
            }
            None => false,
        }
    }

    /// Remove a car permanently.
    pub fn remove(&self, id: &str) -> Option<Car> {
        self.cars.lock().remove(id)
    }

    /// Number of known cars.
    pub fn len(&self) -> usize {
        self.cars.lock().len()
    }

    /// Whether the registry holds no cars.
    pub fn is_empty(&self) -> bool {
        self.cars.lock().is_empty()
    }

    /// Number of connected cars.
    pub fn connected_count(&self) -> usize {
        self.cars.lock().values().filter(|car| car.connected).count()
    }

    /// Address to deliver a command to, if the car can currently receive one.
    pub fn deliverable_address(&self, id: &str) -> Result<SocketAddr, FleetError> {
        match self.cars.lock().get(id) {
            Some(car) if car.connected => Ok(car.address),
            Some(_) => Err(FleetError::CarDisconnected(id.to_string())),
            None => Err(FleetError::CarNotFound(id.to_string())),
        }
    }

    /// A transmission to the car failed: mark it disconnected.
    pub fn record_send_failure(&self, id: &str) {
        if let Some(car) = self.cars.lock().get_mut(id) {
            car.connected = false;
            car.connection_attempts += 1;
        }
    }

    /// Connected cars whose last telemetry is younger than `window`.
    pub fn fresh_connected(&self, now: DateTime<Utc>, window: Duration) -> Vec<Car> {
        self.cars
            .lock()
            .values()
            .filter(|car| car.connected && !older_than(car, now, window))
            .cloned()
            .collect()
    }

    /// Stamp the cars that were just sent in a broadcast frame.
    pub fn mark_broadcast<'a>(&self, ids: impl IntoIterator<Item = &'a str>, at: DateTime<Utc>) {
        let mut cars = self.cars.lock();
        for id in ids {
            if let Some(car) = cars.get_mut(id) {
                car.last_broadcast = Some(at);
            }
        }
    }

    /// Mark connected cars silent for longer than `timeout` as disconnected.
    /// Returns the identifiers that changed state.
    pub fn mark_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut stale = Vec::new();
        {
            let mut cars = self.cars.lock();
            for car in cars.values_mut() {
                if car.connected && older_than(car, now, timeout) {
                    car.connected = false;
                    stale.push(car.id.clone());
                }
            }
        }
        for id in &stale {
            warn!("Car {id} timed out, marked disconnected");
        }
        stale
    }

    /// Remove disconnected cars silent for longer than `retention`.
    /// Connected cars are never removed. Returns the removed identifiers.
    pub fn reap(&self, now: DateTime<Utc>, retention: Duration) -> Vec<String> {
        let mut cars = self.cars.lock();
        let expired: Vec<String> = cars
            .values()
            .filter(|car| !car.connected && older_than(car, now, retention))
            .map(|car| car.id.clone())
            .collect();
        for id in &expired {
            cars.remove(id);
            debug!("Reaped car {id}");
        }
        expired
    }
}

/// Whether the car's last telemetry is strictly older than `limit` at `now`.
fn older_than(car: &Car, now: DateTime<Utc>, limit: Duration) -> bool {
    car.silence(now)
        .to_std()
        .map(|silence| silence > limit)
        .unwrap_or(false)
}
