//! Telemetry receive loop.
//!
//! The only writer of car pose and velocity. A (re)joining car gets a
//! reconnect acknowledgment and triggers one off-cycle broadcast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use convoy_core::registry::{FleetRegistry, UpsertEvent};
use convoy_core::wire::{TelemetryPacket, reconnect_ack};

use crate::scheduler::BroadcastScheduler;
use crate::socket::DatagramSocket;

/// Largest datagram read from the telemetry socket.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Pause after a failed receive before reading again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Receive loop for the telemetry socket.
pub struct TelemetryIngest {
    socket: Arc<dyn DatagramSocket>,
    registry: Arc<FleetRegistry>,
    scheduler: BroadcastScheduler,
}

impl TelemetryIngest {
    /// `scheduler` is triggered whenever a car (re)joins.
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        registry: Arc<FleetRegistry>,
        scheduler: BroadcastScheduler,
    ) -> Self {
        Self {
            socket,
            registry,
            scheduler,
        }
    }

    /// Process one datagram. `None` means it was dropped as malformed.
    pub async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) -> Option<UpsertEvent> {
        let packet = match TelemetryPacket::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Dropped datagram from {from}: {e}");
                return None;
            }
        };

        let event = self
            .registry
            .upsert(&packet.car_id, from, packet.telemetry);

        if event.is_reconnection() {
            self.acknowledge(&packet.car_id).await;
            self.scheduler.trigger();
        }
        Some(event)
    }

    async fn acknowledge(&self, car_id: &str) {
        // The car may have been marked disconnected in the meantime.
        let Ok(addr) = self.registry.deliverable_address(car_id) else {
            return;
        };
        let ack = reconnect_ack(car_id);
        match self.socket.send_to(ack.as_bytes(), addr).await {
            Ok(_) => debug!("Sent reconnect ack to {car_id} ({addr})"),
            Err(e) => warn!("Reconnect ack to {car_id} failed: {e}"),
        }
    }

    /// Receive until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("Telemetry ingest shutting down");
                    break;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            self.handle_datagram(&buf[..len], from).await;
                        }
                        Err(e) => {
                            warn!("Telemetry recv error: {e}");
                            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        }
                    }
                }
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
    use crate::scheduler::BroadcastSettings;
    use crate::socket::testing::ScriptedSocket;
    use crate::transport::BroadcastTransport;
    use convoy_core::topology::TopologyMatrix;
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// Socket whose every receive fails.
    #[derive(Default)]
    struct BrokenSocket {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl DatagramSocket for BrokenSocket {
        async fn send_to(&self, payload: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Ok(payload.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("network is down"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    fn scheduler(
        registry: Arc<FleetRegistry>,
        enabled: bool,
    ) -> (BroadcastScheduler, Arc<ScriptedSocket>) {
        let socket = Arc::new(ScriptedSocket::default());
        let transport = Arc::new(BroadcastTransport::new(
            socket.clone(),
            SocketAddr::from(([127, 0, 0, 1], 8081)),
        ));
        let scheduler = BroadcastScheduler::new(
            registry,
            Arc::new(RwLock::new(TopologyMatrix::default())),
            Arc::new(Mutex::new(BroadcastSettings {
                enabled,
                interval: Duration::from_millis(70),
                group_size: 1,
            })),
            Some(transport),
            Duration::ZERO,
            Duration::from_secs(3),
        );
        (scheduler, socket)
    }

    #[tokio::test]
    async fn test_first_packet_creates_car_and_acks() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, frames) = scheduler(registry.clone(), true);
        let socket = Arc::new(ScriptedSocket::default());
        let ingest = TelemetryIngest::new(socket.clone(), registry.clone(), scheduler);

        let from = SocketAddr::from(([192, 168, 1, 5], 4000));
        let event = ingest
            .handle_datagram(b"CAR1:1.234,2.346,45.67,7.4,0.1,0.2,0.0", from)
            .await;
        assert_eq!(event, Some(UpsertEvent::Created));

        let car = registry.get("CAR1").unwrap();
        assert_eq!(car.address, from);
        assert!((car.speed() - 0.05f64.sqrt()).abs() < 1e-9);

        assert_eq!(
            socket.sent_to(),
            vec![("RECONNECT_ACK:CAR1,SERVER_READY".to_string(), from)]
        );

        // Let the off-cycle broadcast task run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            frames.sent(),
            vec!["[1 C1 1.23 2.35 45.7 0.1000 0.2000 0.0000]"]
        );
    }

    #[tokio::test]
    async fn test_routine_update_sends_no_ack() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, _) = scheduler(registry.clone(), false);
        let socket = Arc::new(ScriptedSocket::default());
        let ingest = TelemetryIngest::new(socket.clone(), registry.clone(), scheduler);
        let from = SocketAddr::from(([127, 0, 0, 1], 4000));

        ingest.handle_datagram(b"CAR2:0,0,0,7,0,0,0", from).await;
        let event = ingest.handle_datagram(b"CAR2:1,0,0,7,0,0,0", from).await;
        assert_eq!(event, Some(UpsertEvent::Updated));
        assert_eq!(socket.sent().len(), 1);
        assert_eq!(registry.get("CAR2").unwrap().update_count, 1);
    }

    #[tokio::test]
    async fn test_address_change_is_reconnection() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, _) = scheduler(registry.clone(), false);
        let socket = Arc::new(ScriptedSocket::default());
        let ingest = TelemetryIngest::new(socket.clone(), registry.clone(), scheduler);

        ingest
            .handle_datagram(b"CAR3:0,0,0,7,0,0,0", SocketAddr::from(([127, 0, 0, 1], 4000)))
            .await;
        let moved = SocketAddr::from(([127, 0, 0, 1], 4001));
        let event = ingest.handle_datagram(b"CAR3:0,0,0,7,0,0,0", moved).await;

        assert_eq!(event, Some(UpsertEvent::Reconnected));
        assert_eq!(socket.sent_to().last().map(|(_, addr)| *addr), Some(moved));
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, _) = scheduler(registry.clone(), true);
        let socket = Arc::new(ScriptedSocket::default());
        let ingest = TelemetryIngest::new(socket.clone(), registry.clone(), scheduler);
        let from = SocketAddr::from(([127, 0, 0, 1], 4000));

        let payloads: [&[u8]; 6] = [
            b"",
            b"   ",
            b"CAR1",
            b"CAR1:1,2,3",
            b"CAR1:a,b,c,d,e,f,g",
            b"CAR1:1:2,3,4,5,6,7,8",
        ];
        for payload in payloads {
            assert!(ingest.handle_datagram(payload, from).await.is_none());
        }
        assert!(registry.is_empty());
        assert!(socket.sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_over_loopback() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, _) = scheduler(registry.clone(), false);
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        let ingest = TelemetryIngest::new(server, registry.clone(), scheduler);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ingest.run(rx));

        let car = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        car.send_to(b"CAR4:1,2,3,7.9,0,0,0\n", server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), car.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"RECONNECT_ACK:CAR4,SERVER_READY");
        assert!(registry.is_connected("CAR4"));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_errors_back_off() {
        let registry = Arc::new(FleetRegistry::new());
        let (scheduler, _) = scheduler(registry.clone(), false);
        let socket = Arc::new(BrokenSocket::default());
        let ingest = TelemetryIngest::new(socket.clone(), registry, scheduler);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ingest.run(rx));
        tokio::time::sleep(Duration::from_millis(55)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        // One read per backoff period: t = 0, 10, ..., 50 ms.
        let reads = socket.reads.load(Ordering::SeqCst);
        assert!((5..=7).contains(&reads), "reads = {reads}");
    }
}
