//! Command delivery: bounded-retry unicast to one car and subnet broadcast.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use convoy_core::error::FleetError;
use convoy_core::registry::FleetRegistry;

use crate::socket::DatagramSocket;

/// Broadcast address used when the subnet cannot be determined.
pub const FALLBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 31, 255);

/// Result of a bounded retry sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub succeeded: bool,
    /// Attempts actually made, including the successful one.
    pub attempts: u32,
}

/// Run `attempt` up to `max_attempts` times, sleeping `delay` between tries,
/// and stop at the first success.
pub async fn send_with_retries<F, Fut>(max_attempts: u32, delay: Duration, mut attempt: F) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut attempts = 0;
    while attempts < max_attempts {
        attempts += 1;
        if attempt(attempts).await {
            return RetryOutcome {
                succeeded: true,
                attempts,
            };
        }
        if attempts < max_attempts {
            tokio::time::sleep(delay).await;
        }
    }
    RetryOutcome {
        succeeded: false,
        attempts,
    }
}

// ---------------------------------------------------------------------------
// Unicast
// ---------------------------------------------------------------------------

/// Point-to-point command delivery over the telemetry socket.
pub struct UnicastTransport {
    socket: Arc<dyn DatagramSocket>,
    registry: Arc<FleetRegistry>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl UnicastTransport {
    /// Reliable sends make up to `max_attempts` tries, `retry_delay` apart.
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        registry: Arc<FleetRegistry>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            socket,
            registry,
            max_attempts,
            retry_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Send one command to a connected car.
    ///
    /// A newline is appended if missing. A transmission error marks the car
    /// disconnected.
    pub async fn send_once(&self, car_id: &str, message: &str) -> Result<(), FleetError> {
        let addr = self.registry.deliverable_address(car_id)?;

        let mut payload = message.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        match self.socket.send_to(payload.as_bytes(), addr).await {
            Ok(_) => {
                debug!("Sent to {car_id} ({addr}): {message}");
                Ok(())
            }
            Err(e) => {
                self.registry.record_send_failure(car_id);
                warn!("Send to {car_id} ({addr}) failed, marked disconnected: {e}");
                Err(FleetError::Transport(e.to_string()))
            }
        }
    }

    /// Send with the configured number of attempts.
    pub async fn send_reliable(&self, car_id: &str, message: &str) -> bool {
        self.send_reliable_with(car_id, message, self.max_attempts)
            .await
            .succeeded
    }

    /// Send with an explicit attempt budget.
    pub async fn send_reliable_with(
        &self,
        car_id: &str,
        message: &str,
        max_attempts: u32,
    ) -> RetryOutcome {
        let outcome = send_with_retries(max_attempts, self.retry_delay, |attempt| async move {
            match self.send_once(car_id, message).await {
                Ok(()) => true,
                Err(e) => {
                    trace!("Attempt {attempt}/{max_attempts} to {car_id} failed: {e}");
                    false
                }
            }
        })
        .await;

        if !outcome.succeeded {
            warn!("Giving up on {car_id} after {} attempts: {message}", outcome.attempts);
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Subnet broadcast sender for frames and global commands.
pub struct BroadcastTransport {
    socket: Arc<dyn DatagramSocket>,
    target: SocketAddr,
}

impl BroadcastTransport {
    /// Wrap an already configured socket.
    pub fn new(socket: Arc<dyn DatagramSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }

    /// Bind a broadcast-enabled UDP socket on `port`. The port is bound with
    /// `SO_REUSEADDR` so a simulator on the same host can share it.
    pub async fn bind(port: u16, target: SocketAddr) -> Result<Self, FleetError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = broadcast_socket(bind_addr).map_err(|e| FleetError::Bind {
            addr: bind_addr.to_string(),
            reason: e.to_string(),
        })?;

        info!("Broadcast socket bound on {}, target {target}", socket.local_addr()?);
        Ok(Self::new(Arc::new(socket), target))
    }

    /// Locally bound address of the broadcast socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one payload to the broadcast target. Failures are logged.
    pub async fn send_once(&self, message: &str) -> bool {
        match self.socket.send_to(message.as_bytes(), self.target).await {
            Ok(_) => {
                trace!("Broadcast -> {}: {message}", self.target);
                true
            }
            Err(e) => {
                warn!("Broadcast to {} failed: {e}", self.target);
                false
            }
        }
    }

    /// Send the payload `repeats` times, pausing `delay` between copies.
    /// True if at least one copy went out.
    pub async fn send_reliable(&self, message: &str, repeats: u32, delay: Duration) -> bool {
        let mut delivered = 0;
        for i in 0..repeats {
            if self.send_once(message).await {
                delivered += 1;
            }
            if i + 1 < repeats {
                tokio::time::sleep(delay).await;
            }
        }
        debug!("Broadcast command '{message}' sent {delivered}/{repeats} times");
        delivered > 0
    }
}

/// Non-blocking UDP socket with `SO_REUSEADDR` and `SO_BROADCAST` set.
fn broadcast_socket(bind_addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

// ---------------------------------------------------------------------------
// Broadcast address resolution
// ---------------------------------------------------------------------------

/// /24 broadcast address for a routable local IPv4 address.
pub fn subnet_broadcast(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
        return None;
    }
    let [a, b, c, _] = ip.octets();
    Some(Ipv4Addr::new(a, b, c, 255))
}

/// Local IPv4 address of the default route. No packet is sent.
async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// Pick the broadcast address: explicit override, detected subnet, or
/// [`FALLBACK_BROADCAST`].
pub async fn resolve_broadcast_addr(configured: Option<Ipv4Addr>) -> Ipv4Addr {
    if let Some(addr) = configured {
        return addr;
    }
    match local_ipv4().await.and_then(subnet_broadcast) {
        Some(addr) => {
            info!("Detected subnet broadcast address {addr}");
            addr
        }
        None => {
            warn!("Cannot detect broadcast address, using {FALLBACK_BROADCAST}");
            FALLBACK_BROADCAST
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
