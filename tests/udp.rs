//! Datagram integration tests over loopback UDP

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use socket_engine::{
    CommunicationType, Dialer, DialerOptions, EndpointConfig, Listener, Message, MessageBoxes,
    ProtocolEngine, SecurityMode, ServerOptions, TaskConfig,
};
use tokio::net::UdpSocket;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);
const PASSPHRASE: &str = "datagram tests share this forty-char key";

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_zero_length_datagram_is_a_cycle() {
    let port = free_udp_port();
    let boxes = MessageBoxes::single(4);
    let listener = Arc::new(
        Listener::new(
            EndpointConfig::udp("127.0.0.1", port, 1500, 1000, 1).unwrap(),
            ProtocolEngine::new(TaskConfig::new(CommunicationType::UdpReceive), boxes.clone())
                .unwrap(),
            ServerOptions::default(),
        )
        .unwrap(),
    );
    let running = Arc::clone(&listener);
    let serve = tokio::spawn(async move { running.run_socket().await });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // resend until the listener is bound and has counted one
    let mut finished = false;
    for _ in 0..200 {
        client.send_to(&[], ("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if serve.is_finished() {
            finished = true;
            break;
        }
    }
    assert!(finished, "listener never counted the datagram");
    let summary = serve.await.unwrap().unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.failed_cycles, 0);
    assert!(summary.limit_reached);
    assert!(boxes.at(0).unwrap().is_empty());
    assert_eq!(listener.metrics().snapshot().datagrams_received, 1);
}

#[tokio::test]
async fn test_encrypted_datagrams_with_ack() {
    let port = free_udp_port();
    let task = |communication| {
        TaskConfig::new(communication).with_security(SecurityMode::Symmetric256High, PASSPHRASE)
    };

    let inbound = MessageBoxes::single(8);
    let listener = Arc::new(
        Listener::new(
            EndpointConfig::udp("127.0.0.1", port, 1500, 1000, 2).unwrap(),
            ProtocolEngine::new(task(CommunicationType::UdpReceiveWithAck), inbound.clone())
                .unwrap(),
            ServerOptions::default(),
        )
        .unwrap(),
    );
    let running = Arc::clone(&listener);
    let serve = tokio::spawn(async move { running.run_server().await });
    // an early datagram would be lost and its message with it
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outbound = MessageBoxes::single(8);
    for i in 0..2u8 {
        outbound
            .at(0)
            .unwrap()
            .try_enqueue(Message::new(0, "sample", vec![i; 200]))
            .unwrap();
    }
    let dialer = Dialer::new(
        EndpointConfig::udp("127.0.0.1", port, 1500, 1000, 2).unwrap(),
        ProtocolEngine::new(task(CommunicationType::UdpSendWithAck), outbound).unwrap(),
        DialerOptions {
            interval: Duration::from_millis(10),
            ..DialerOptions::default()
        },
    )
    .unwrap();

    let sent = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.cycles, 2);
    assert_eq!(sent.failed_cycles, 0);

    let received = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(received.cycles, 2);
    assert_eq!(received.failed_cycles, 0);

    let box0 = inbound.at(0).unwrap();
    assert_eq!(box0.len(), 2);
    let first = box0.try_dequeue().unwrap();
    assert_eq!(first.kind, "sample");
    assert_eq!(first.payload.len(), 200);
}

#[tokio::test]
async fn test_oversized_datagram_fails_cycle() {
    let port = free_udp_port();
    let outbound = MessageBoxes::single(1);
    outbound
        .at(0)
        .unwrap()
        .try_enqueue(Message::new(0, "big", vec![0u8; 600]))
        .unwrap();
    let dialer = Arc::new(
        Dialer::new(
            EndpointConfig::udp("127.0.0.1", port, 512, 200, 1).unwrap(),
            ProtocolEngine::new(TaskConfig::new(CommunicationType::UdpSend), outbound.clone())
                .unwrap(),
            DialerOptions {
                interval: Duration::from_millis(5),
                ..DialerOptions::default()
            },
        )
        .unwrap(),
    );
    let running = Arc::clone(&dialer);
    let run = tokio::spawn(async move { running.run_socket().await });

    // the only message is consumed by the failed cycle, later passes idle
    tokio::time::sleep(Duration::from_millis(200)).await;
    dialer.stop_socket();
    let summary = tokio::time::timeout(TEST_TIMEOUT, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.failed_cycles, 1);
    assert_eq!(summary.cycles, 0);
    assert!(summary.idle_timeouts >= 1);
    assert!(outbound.at(0).unwrap().is_empty());
}

#[test]
fn test_multicast_rejects_unicast_host() {
    let result = EndpointConfig::udp("10.0.0.1", 9000, 1500, 1000, -1)
        .unwrap()
        .with_multicast(1);
    assert!(result.is_err());
}
