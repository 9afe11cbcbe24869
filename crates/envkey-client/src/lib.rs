//! # envkey-client
//!
//! Foreground client for the envkey-source daemon. Talks only to the
//! daemon's IPC surface: the loopback HTTP control endpoints and the
//! line-delimited TCP notification stream. Never touches the fetch
//! pipeline directly.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use envkey_daemon::ipc::{
    http_base, tcp_addr, DaemonResponse, EnvMap, Notification, DEFAULT_ROLLING_PCT,
    DEFAULT_WATCH_THROTTLE_MS,
};

/// Client-side failures. Everything here is about reaching or keeping the
/// daemon, not about the remote service.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("ENVKEY invalid")]
    EnvkeyInvalid,

    #[error("error loading ENVKEY: {0}")]
    Daemon(String),

    #[error("couldn't connect to envkey daemon: {0}")]
    DaemonConnectFailed(String),

    #[error("lost connection to envkey daemon")]
    LostDaemonConnection,

    #[error("envkey-source daemon couldn't be started")]
    DaemonStartFailed,
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Whether a daemon is answering on the control port.
pub async fn is_alive() -> bool {
    let client = match short_timeout_client() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(format!("{}/alive", http_base())).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Ask a running daemon to exit. A missing daemon is not an error.
pub async fn stop() {
    if let Ok(client) = short_timeout_client() {
        let _ = client.get(format!("{}/stop", http_base())).send().await;
    }
}

/// Start the daemon as a detached copy of this executable unless one is
/// already running, then wait for it to answer.
pub async fn launch_detached_if_needed() -> Result<()> {
    if is_alive().await {
        debug!("envkey-source daemon already running");
        return Ok(());
    }

    let exe = std::env::current_exe()
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;
    debug!(?exe, "starting envkey-source daemon");

    let child = std::process::Command::new(exe)
        .arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;
    // The child owns its own lifetime from here.
    drop(child);

    for _ in 0..=50 {
        if is_alive().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Err(ClientError::DaemonStartFailed)
}

/// Fetch through the daemon with default rolling options.
pub async fn fetch_map(
    envkey: &str,
    client_name: &str,
    client_version: &str,
) -> Result<(EnvMap, EnvMap)> {
    fetch_map_with(
        envkey,
        client_name,
        client_version,
        false,
        DEFAULT_ROLLING_PCT,
        DEFAULT_WATCH_THROTTLE_MS,
    )
    .await
}

/// Fetch `{current, previous}` through the daemon, registering rolling
/// options for the websocket the daemon opens on first fetch.
pub async fn fetch_map_with(
    envkey: &str,
    client_name: &str,
    client_version: &str,
    rolling_reload: bool,
    rolling_pct: u8,
    watch_throttle: u32,
) -> Result<(EnvMap, EnvMap)> {
    let mut url = reqwest::Url::parse(&http_base())
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::DaemonConnectFailed("invalid daemon url".to_string()))?
        .push("fetch")
        .push(envkey)
        .push(client_name)
        .push(client_version)
        .push(&rolling_reload.to_string())
        .push(&rolling_pct.to_string())
        .push(&watch_throttle.to_string());

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;

    match response.status().as_u16() {
        200 => {}
        401 | 404 => return Err(ClientError::EnvkeyInvalid),
        _ => {
            let body = response.text().await.unwrap_or_default();
            if body.contains("ENVKEY invalid") {
                return Err(ClientError::EnvkeyInvalid);
            }
            return Err(ClientError::Daemon(body));
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ClientError::Daemon(e.to_string()))?;
    let decoded =
        DaemonResponse::decode(&body).map_err(|e| ClientError::Daemon(e.to_string()))?;
    Ok((decoded.current_env, decoded.previous_env))
}

/// An event on the daemon's notification stream, decoded for consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Change,
    WillReconnect,
    Reconnected,
    ReconnectedNoChange,
    Suspended,
    SuspendedNoChange,
    Invalid,
    Throttled,
    StartRolling { batch: u16, total: u16 },
    RollingComplete,
    LostDaemonConnection,
}

impl From<Notification> for ChangeEvent {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::EnvUpdate => ChangeEvent::Change,
            Notification::WillReconnect => ChangeEvent::WillReconnect,
            Notification::Reconnected => ChangeEvent::Reconnected,
            Notification::ReconnectedNoChange => ChangeEvent::ReconnectedNoChange,
            Notification::Suspended => ChangeEvent::Suspended,
            Notification::SuspendedNoChange => ChangeEvent::SuspendedNoChange,
            Notification::EnvkeyInvalid => ChangeEvent::Invalid,
            Notification::ConnectionThrottled => ChangeEvent::Throttled,
            Notification::StartRolling { batch, total } => {
                ChangeEvent::StartRolling { batch, total }
            }
            Notification::RollingComplete => ChangeEvent::RollingComplete,
        }
    }
}

/// A live subscription to change notifications for one ENVKEY.
pub struct ChangeListener {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeListener {
    /// The next event, or `None` once the stream has ended (after a
    /// terminal event or lost connection).
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

/// Subscribe to the daemon's notification stream. The daemon only accepts
/// subscribers for ENVKEYs it has already fetched, so call
/// [`fetch_map`] first.
pub async fn listen_change(envkey: &str) -> Result<ChangeListener> {
    let stream = TcpStream::connect(tcp_addr())
        .await
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;
    let (read_half, mut write_half) = stream.into_split();

    let connection_id = Uuid::new_v4().to_string();
    let hello = format!("{envkey}|{connection_id}\n");
    write_half
        .write_all(hello.as_bytes())
        .await
        .map_err(|e| ClientError::DaemonConnectFailed(e.to_string()))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Keep the write half alive for the duration of the subscription;
        // dropping it would half-close the connection.
        let _write_half = write_half;
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => {
                    let _ = events_tx.send(ChangeEvent::LostDaemonConnection);
                    return;
                }
                Ok(_) => {
                    let event = ChangeEvent::from(Notification::parse(&line));
                    let terminal = matches!(
                        event,
                        ChangeEvent::Invalid | ChangeEvent::Throttled
                    );
                    if events_tx.send(event).is_err() || terminal {
                        return;
                    }
                }
            }
        }
    });

    Ok(ChangeListener { events: events_rx })
}

/// Convenience wrapper: refetch on every change and hand `(current,
/// previous)` to the callback. Returns when the subscription ends.
pub async fn listen_change_with_env<F>(
    envkey: &str,
    client_name: &str,
    client_version: &str,
    mut on_change: F,
) -> Result<()>
where
    F: FnMut(EnvMap, EnvMap),
{
    let mut listener = listen_change(envkey).await?;

    while let Some(event) = listener.next_event().await {
        match event {
            ChangeEvent::Change => {
                let (current, previous) = fetch_map(envkey, client_name, client_version).await?;
                on_change(current, previous);
            }
            ChangeEvent::Invalid => return Err(ClientError::EnvkeyInvalid),
            ChangeEvent::Throttled => {
                return Err(ClientError::Daemon(
                    "active socket connection limit reached".to_string(),
                ))
            }
            ChangeEvent::LostDaemonConnection => {
                return Err(ClientError::LostDaemonConnection)
            }
            other => debug!(?other, "socket lifecycle event"),
        }
    }

    Ok(())
}

fn short_timeout_client() -> std::result::Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
}
