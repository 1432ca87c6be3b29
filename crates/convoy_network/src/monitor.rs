//! Liveness timeout and reaping of long-gone cars.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use convoy_core::registry::FleetRegistry;

/// Marks cars disconnected once they stop reporting.
pub struct HealthMonitor {
    registry: Arc<FleetRegistry>,
    period: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    /// Check every `period`; cars silent longer than `timeout` are disconnected.
    pub fn new(registry: Arc<FleetRegistry>, period: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            period,
            timeout,
        }
    }

    /// One pass at `now`. Returns the cars that were just disconnected.
    pub fn check(&self, now: DateTime<Utc>) -> Vec<String> {
        self.registry.mark_stale(now, self.timeout)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    self.check(Utc::now());
                }
                _ = shutdown.recv() => {
                    debug!("Health monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Forgets cars that stayed disconnected past the retention timeout.
pub struct Reaper {
    registry: Arc<FleetRegistry>,
    period: Duration,
    retention: Duration,
}

impl Reaper {
    /// Sweep every `period`; disconnected cars silent longer than
    /// `retention` are removed.
    pub fn new(registry: Arc<FleetRegistry>, period: Duration, retention: Duration) -> Self {
        Self {
            registry,
            period,
            retention,
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let removed = self.registry.reap(now, self.retention);
        if !removed.is_empty() {
            info!("Removed {} long-disconnected cars: {removed:?}", removed.len());
        }
        removed
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    self.sweep(Utc::now());
                }
                _ = shutdown.recv() => {
                    debug!("Reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::wire::Telemetry;
    use std::net::SocketAddr;

    fn registry_at(t0: DateTime<Utc>, ids: &[&str]) -> Arc<FleetRegistry> {
        let registry = Arc::new(FleetRegistry::new());
        for id in ids {
            registry.upsert_at(
                id,
                SocketAddr::from(([127, 0, 0, 1], 7000)),
                Telemetry::default(),
                t0,
            );
        }
        registry
    }

    #[test]
    fn test_health_check_thresholds() {
        let t0 = Utc::now();
        let registry = registry_at(t0, &["CAR1"]);
        let monitor = HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(2),
            Duration::from_secs(5),
        );

        assert!(monitor.check(t0 + chrono::Duration::seconds(4)).is_empty());
        assert!(registry.is_connected("CAR1"));

        assert_eq!(monitor.check(t0 + chrono::Duration::seconds(6)), vec!["CAR1"]);
        assert!(!registry.is_connected("CAR1"));

        // Already disconnected; nothing changes on the next pass.
        assert!(monitor.check(t0 + chrono::Duration::seconds(8)).is_empty());
    }

    #[test]
    fn test_reaper_only_removes_disconnected() {
        let t0 = Utc::now();
        let registry = registry_at(t0, &["CAR1", "CAR2"]);
        registry.set_connected("CAR2", false);
        let reaper = Reaper::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_secs(60),
        );

        assert!(reaper.sweep(t0 + chrono::Duration::seconds(30)).is_empty());
        assert_eq!(reaper.sweep(t0 + chrono::Duration::seconds(61)), vec!["CAR2"]);
        assert!(registry.get("CAR1").is_some());
        assert!(registry.get("CAR2").is_none());
    }

    #[tokio::test]
    async fn test_loops_exit_on_shutdown() {
        let registry = Arc::new(FleetRegistry::new());
        let (tx, _) = broadcast::channel(1);

        let health = tokio::spawn(
            HealthMonitor::new(registry.clone(), Duration::from_secs(2), Duration::from_secs(5))
                .run(tx.subscribe()),
        );
        let reaper = tokio::spawn(
            Reaper::new(registry, Duration::from_secs(10), Duration::from_secs(60))
                .run(tx.subscribe()),
        );

        tx.send(()).unwrap();
        health.await.unwrap();
        reaper.await.unwrap();
    }
}
