//! End-to-end flow over loopback: telemetry in, broadcast frame out,
//! formation commands delivered to the car.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use convoy_core::config::FleetConfig;
use convoy_network::FleetServer;

async fn recv_text(socket: &UdpSocket) -> String {
    let mut buf = [0u8; 512];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv failed");
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Read until a datagram matching `pred` arrives.
async fn recv_matching(socket: &UdpSocket, pred: impl Fn(&str) -> bool) -> String {
    loop {
        let text = recv_text(socket).await;
        if pred(&text) {
            return text;
        }
    }
}

#[tokio::test]
async fn telemetry_broadcast_and_formation_over_loopback() {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = FleetConfig {
        telemetry_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        broadcast_addr: Some(Ipv4Addr::LOCALHOST),
        broadcast_port: listener.local_addr().unwrap().port(),
        broadcast_bind_port: 0,
        broadcast_enabled: true,
        broadcast_interval: Duration::from_millis(20),
        unicast_retry_delay: Duration::from_millis(5),
        ..FleetConfig::default()
    };

    let mut server = FleetServer::new(config).unwrap();
    server.start().await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let control = server.control().unwrap();

    // A car reports in and is acknowledged.
    let car = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    car.send_to(b"CAR1:1.5,-2.25,90.0,7.8,0.3,0.4,0.0\n", server_addr)
        .await
        .unwrap();
    assert_eq!(recv_text(&car).await, "RECONNECT_ACK:CAR1,SERVER_READY");

    // Its state shows up in broadcast frames.
    let frame = recv_matching(&listener, |f| f.starts_with("[1 C1 ")).await;
    assert_eq!(frame, "[1 C1 1.50 -2.25 90.0 0.3000 0.4000 0.0000]");

    let snapshot = control.snapshot();
    assert_eq!(snapshot.connected, 1);
    assert!((snapshot.cars[0].speed() - 0.5).abs() < 1e-9);

    // Formation start reaches the car as start + role.
    let report = control.start_formation("CAR1", "line").await.unwrap();
    assert_eq!(report.delivery.succeeded, 1);
    assert_eq!(recv_text(&car).await, "[F,S,CAR1,line]\n");
    assert_eq!(recv_text(&car).await, "[F,L,CAR1]\n");

    // Topology changes are announced on the broadcast port.
    let status = control.set_topology_enabled(true).await;
    assert_eq!(status.broadcast_success, Some(true));
    recv_matching(&listener, |f| f == "[T,E,1]").await;

    let stop = control.stop_formation().await;
    assert_eq!(stop.succeeded, 1);
    assert_eq!(recv_text(&car).await, "[F,T]\n");

    server.stop();
}

#[tokio::test]
async fn disconnected_leader_is_rejected_end_to_end() {
    let config = FleetConfig {
        telemetry_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        broadcast_addr: Some(Ipv4Addr::LOCALHOST),
        broadcast_bind_port: 0,
        ..FleetConfig::default()
    };
    let mut server = FleetServer::new(config).unwrap();
    server.start().await.unwrap();
    let control = server.control().unwrap();

    let err = control.start_formation("CAR1", "line").await.unwrap_err();
    assert!(err.is_validation());
    assert!(!control.formation_status().enabled);

    server.stop();
}
