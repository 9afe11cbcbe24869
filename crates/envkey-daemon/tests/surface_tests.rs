//! The daemon's HTTP and TCP surfaces, driven over real loopback sockets
//! on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use envkey_daemon::ipc::Notification;
use envkey_daemon::{http, Daemon};

async fn spawn_http(daemon: Arc<Daemon>) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, http::router(daemon)).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_tcp(daemon: Arc<Daemon>) -> std::net::SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(daemon.serve_tcp(listener));
    addr
}

fn test_daemon() -> Arc<Daemon> {
    // Never exit the test process on idle.
    Arc::new(Daemon::new(false, false))
}

fn env_of(pairs: &[(&str, &str)]) -> envkey_daemon::ipc::EnvMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_alive_reports_version() {
    let base = spawn_http(test_daemon()).await;

    let response = reqwest::get(format!("{base}/alive")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body = response.text().await.unwrap();
    assert!(body.contains(http::DAEMON_VERSION));
}

#[tokio::test]
async fn test_fetch_rejects_malformed_envkey() {
    let base = spawn_http(test_daemon()).await;

    // A one-segment credential fails before any network traffic.
    let url = format!("{base}/fetch/justonesegment/name/1.0.0/false/25/1000");
    let response = reqwest::get(url).await.unwrap();

    assert_eq!(response.status().as_u16(), 500);
    let body = response.text().await.unwrap();
    assert!(body.contains("ENVKEY invalid"));
}

#[tokio::test]
async fn test_tcp_rejects_subscriber_without_fetched_env() {
    let daemon = test_daemon();
    let addr = spawn_tcp(daemon).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"unfetched-ek|conn-1\n").await.unwrap();

    // The daemon closes the connection instead of registering it.
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_tcp_subscriber_receives_notifications_in_order() {
    let daemon = test_daemon();
    let addr = spawn_tcp(daemon.clone()).await;

    daemon
        .state
        .update_env("ek-pw", env_of(&[("A", "1")]), Default::default());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ek-pw|conn-1\n").await.unwrap();

    // Give the daemon a beat to register the subscriber.
    let mut tries = 0;
    while daemon.state.subscriber_senders("ek-pw").is_empty() {
        tries += 1;
        assert!(tries < 100, "subscriber never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    daemon.state.broadcast("ek-pw", Notification::WillReconnect);
    daemon.state.broadcast("ek-pw", Notification::Reconnected);
    daemon.state.broadcast("ek-pw", Notification::EnvUpdate);

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    for expected in ["will_reconnect", "reconnected", "env_update"] {
        line.clear();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.trim(), expected);
    }
}

#[tokio::test]
async fn test_tcp_disconnect_unregisters_subscriber() {
    let daemon = test_daemon();
    let addr = spawn_tcp(daemon.clone()).await;

    daemon
        .state
        .update_env("ek-pw", env_of(&[("A", "1")]), Default::default());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ek-pw|conn-1\n").await.unwrap();

    let mut tries = 0;
    while daemon.state.subscriber_senders("ek-pw").is_empty() {
        tries += 1;
        assert!(tries < 100, "subscriber never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(stream);

    let mut tries = 0;
    while !daemon.state.subscriber_senders("ek-pw").is_empty() {
        tries += 1;
        assert!(tries < 100, "subscriber never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
