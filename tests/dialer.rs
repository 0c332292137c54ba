//! Send-engine integration tests

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use socket_engine::config::DIALER_EXCEPTION_BUDGET;
use socket_engine::{
    CommunicationType, Dialer, DialerOptions, EndpointConfig, Listener, Message, MessageBoxes,
    ProtocolEngine, ServerOptions, TaskConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_options() -> DialerOptions {
    DialerOptions {
        interval: Duration::from_millis(20),
        ..DialerOptions::default()
    }
}

fn queued(count: u8) -> MessageBoxes {
    let boxes = MessageBoxes::single(16);
    for i in 0..count {
        boxes
            .at(0)
            .unwrap()
            .try_enqueue(Message::new(0, "reading", vec![i; 64]))
            .unwrap();
    }
    boxes
}

#[tokio::test]
async fn test_dialer_delivers_to_listener() {
    let port = free_port();
    let inbound = MessageBoxes::single(16);
    let listener = Listener::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 1000, 3).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpReceive), inbound.clone())
            .unwrap(),
        ServerOptions::default(),
    )
    .unwrap();
    let listener = Arc::new(listener);
    let running = Arc::clone(&listener);
    let serve = tokio::spawn(async move { running.run_server().await });
    // failed connects would count against the dialer's limit
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outbound = queued(3);
    let dialer = Dialer::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 1000, 3).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpSend), outbound.clone())
            .unwrap(),
        fast_options(),
    )
    .unwrap();

    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .expect("dialer should stop at its limit")
        .unwrap();
    assert_eq!(summary.cycles, 3);
    assert!(summary.limit_reached);
    assert!(outbound.at(0).unwrap().is_empty());
    assert_eq!(dialer.metrics().snapshot().messages_sent, 3);

    let served = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .expect("listener should stop at its limit")
        .unwrap()
        .unwrap();
    assert!(served.limit_reached);

    let box0 = inbound.at(0).unwrap();
    let first: Vec<u8> = (0..3).map(|_| box0.try_dequeue().unwrap().payload[0]).collect();
    assert_eq!(first, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_just_once_exhausts_exception_budget() {
    // nothing listens here
    let port = free_port();
    let dialer = Dialer::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 200, 1).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpSend), queued(1)).unwrap(),
        DialerOptions {
            interval: Duration::from_millis(5),
            ..DialerOptions::default()
        },
    )
    .unwrap();

    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .expect("dialer should give up")
        .unwrap();
    assert_eq!(summary.failed_cycles, u64::from(DIALER_EXCEPTION_BUDGET) + 1);
    assert_eq!(summary.cycles, 0);
    assert!(!summary.limit_reached);
    assert!(dialer.control().is_stopped());
    assert_eq!(dialer.control().terminations(), 0);
}

#[tokio::test]
async fn test_failures_are_terminations_when_limited() {
    let port = free_port();
    let dialer = Dialer::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 200, 3).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpSend), queued(1)).unwrap(),
        fast_options(),
    )
    .unwrap();

    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .expect("dialer should stop at its limit")
        .unwrap();
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.failed_cycles, 3);
    assert!(summary.limit_reached);
}

#[tokio::test]
async fn test_reconnect_timeout_stops_dialer() {
    let port = free_port();
    let dialer = Dialer::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 200, -1).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpSend), queued(1)).unwrap(),
        DialerOptions {
            interval: Duration::from_millis(20),
            reconnect_timeout: Duration::from_millis(200),
            proxy: None,
        },
    )
    .unwrap();

    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .expect("dialer should give up after the reconnect timeout")
        .unwrap();
    assert!(summary.failed_cycles >= 1);
    assert!(!summary.limit_reached);
    assert!(dialer.control().is_stopped());
}

#[tokio::test]
async fn test_idle_dialer_stops_on_request() {
    let port = free_port();
    let dialer = Arc::new(
        Dialer::new(
            EndpointConfig::tcp("127.0.0.1", port, 1500, 200, -1).unwrap(),
            ProtocolEngine::new(
                TaskConfig::new(CommunicationType::TcpSend),
                MessageBoxes::single(4),
            )
            .unwrap(),
            DialerOptions {
                interval: Duration::from_millis(20),
                reconnect_timeout: Duration::from_millis(100),
                proxy: None,
            },
        )
        .unwrap(),
    );

    let running = Arc::clone(&dialer);
    let run = tokio::spawn(async move { running.run_socket().await });

    // longer than the reconnect timeout: idle passes must not expire it
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!run.is_finished());
    dialer.stop_socket();

    let summary = tokio::time::timeout(TEST_TIMEOUT, run)
        .await
        .expect("stop should end the loop")
        .unwrap()
        .unwrap();
    assert_eq!(summary.cycles, 0);
    assert_eq!(summary.failed_cycles, 0);
    assert!(summary.idle_timeouts >= 3);
}

#[test]
fn test_proxy_rejected_for_udp() {
    let result = Dialer::new(
        EndpointConfig::udp("127.0.0.1", 9000, 1500, 1000, 1).unwrap(),
        ProtocolEngine::new(
            TaskConfig::new(CommunicationType::UdpSend),
            MessageBoxes::single(1),
        )
        .unwrap(),
        DialerOptions {
            proxy: Some(socket_engine::ProxyConfig::new("127.0.0.1", 1080)),
            ..DialerOptions::default()
        },
    );
    assert!(result.is_err());
}
