//! Dialing through a SOCKS5 proxy

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket_engine::{
    CommunicationType, Dialer, DialerOptions, EndpointConfig, Listener, Message, MessageBoxes,
    ProtocolEngine, ProxyConfig, ServerOptions, TaskConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal SOCKS5 proxy: one CONNECT per client, IPv4 targets only,
/// optional username/password check
async fn spawn_proxy(credentials: Option<(&'static str, &'static str)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(tunnel(client, credentials));
        }
    });
    addr
}

async fn tunnel(mut client: TcpStream, credentials: Option<(&'static str, &'static str)>) {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await.unwrap();
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await.unwrap();

    match credentials {
        None => client.write_all(&[0x05, 0x00]).await.unwrap(),
        Some((user, pass)) => {
            assert!(methods.contains(&0x02));
            client.write_all(&[0x05, 0x02]).await.unwrap();

            let mut ver_ulen = [0u8; 2];
            client.read_exact(&mut ver_ulen).await.unwrap();
            let mut got_user = vec![0u8; ver_ulen[1] as usize];
            client.read_exact(&mut got_user).await.unwrap();
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).await.unwrap();
            let mut got_pass = vec![0u8; plen[0] as usize];
            client.read_exact(&mut got_pass).await.unwrap();

            let ok = got_user == user.as_bytes() && got_pass == pass.as_bytes();
            client
                .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
                .await
                .unwrap();
            if !ok {
                return;
            }
        }
    }

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await.unwrap();
    assert_eq!(&request[..3], &[0x05, 0x01, 0x00]);
    assert_eq!(request[3], 0x01, "test proxy only handles IPv4 targets");
    let mut target = [0u8; 6];
    client.read_exact(&mut target).await.unwrap();
    let ip = Ipv4Addr::new(target[0], target[1], target[2], target[3]);
    let port = u16::from_be_bytes([target[4], target[5]]);

    let Ok(mut upstream) = TcpStream::connect((ip, port)).await else {
        // general failure
        let _ = client.write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
        return;
    };
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await
        .unwrap();
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

fn receiving_listener(port: u16, boxes: MessageBoxes) -> Listener {
    Listener::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 1000, 1).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpReceive), boxes).unwrap(),
        ServerOptions::default(),
    )
    .unwrap()
}

fn proxied_dialer(port: u16, proxy: ProxyConfig, payload: &'static [u8]) -> Dialer {
    let boxes = MessageBoxes::single(1);
    boxes
        .at(0)
        .unwrap()
        .try_enqueue(Message::new(0, "proxied", payload))
        .unwrap();
    Dialer::new(
        EndpointConfig::tcp("127.0.0.1", port, 1500, 1000, 1).unwrap(),
        ProtocolEngine::new(TaskConfig::new(CommunicationType::TcpSend), boxes).unwrap(),
        DialerOptions {
            interval: Duration::from_millis(20),
            reconnect_timeout: Duration::from_secs(5),
            proxy: Some(proxy),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_send_through_proxy() {
    let proxy = spawn_proxy(None).await;
    let port = free_port();
    let inbound = MessageBoxes::single(4);
    let listener = Arc::new(receiving_listener(port, inbound.clone()));
    let running = Arc::clone(&listener);
    let serve = tokio::spawn(async move { running.run_socket().await });

    let dialer = proxied_dialer(
        port,
        ProxyConfig::new(proxy.ip().to_string(), proxy.port()),
        b"via socks",
    );
    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .unwrap()
        .unwrap();
    assert!(summary.limit_reached);

    let served = tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(served.limit_reached);
    let message = inbound.at(0).unwrap().try_dequeue().unwrap();
    assert_eq!(&message.payload[..], b"via socks");
}

#[tokio::test]
async fn test_send_through_authenticated_proxy() {
    let proxy = spawn_proxy(Some(("alice", "wonderland"))).await;
    let port = free_port();
    let inbound = MessageBoxes::single(4);
    let listener = Arc::new(receiving_listener(port, inbound.clone()));
    let running = Arc::clone(&listener);
    let serve = tokio::spawn(async move { running.run_socket().await });

    let dialer = proxied_dialer(
        port,
        ProxyConfig::new(proxy.ip().to_string(), proxy.port())
            .with_credentials("alice", "wonderland"),
        b"authenticated",
    );
    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .unwrap()
        .unwrap();
    assert!(summary.limit_reached);

    tokio::time::timeout(TEST_TIMEOUT, serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message = inbound.at(0).unwrap().try_dequeue().unwrap();
    assert_eq!(&message.payload[..], b"authenticated");
}

#[tokio::test]
async fn test_bad_credentials_exhaust_budget() {
    let proxy = spawn_proxy(Some(("alice", "wonderland"))).await;
    let port = free_port();

    let dialer = proxied_dialer(
        port,
        ProxyConfig::new(proxy.ip().to_string(), proxy.port()).with_credentials("alice", "queen"),
        b"rejected",
    );
    let summary = tokio::time::timeout(TEST_TIMEOUT, dialer.run_socket())
        .await
        .unwrap()
        .unwrap();
    assert!(!summary.limit_reached);
    assert!(summary.failed_cycles > 1);
    assert!(dialer.control().is_stopped());
}
