//! Daemon core: per-ENVKEY fetch + socket lifecycle, the TCP notification
//! server, the suspension watcher, and process startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use envkey_core::defaults::{
    DAEMON_TCP_PORT, FETCH_JITTER_MS, SUSPENSION_CHECK_INTERVAL_SECS, SUSPENSION_TOLERANCE_MS,
};
use envkey_core::{fetch_map, id_part, Envkey, Error, FetchOptions, Result};

use crate::ipc::{DaemonResponse, Notification};
use crate::rolling;
use crate::state::{ClientMeta, DaemonState};
use crate::ws::{self, SocketEvent};

/// Rolling-reload knobs passed through from the foreground client.
#[derive(Debug, Clone, Copy)]
pub struct RollingOptions {
    pub rolling_reload: bool,
    pub rolling_pct: u8,
    pub watch_throttle: u32,
}

#[derive(Serialize)]
struct SocketAuth {
    #[serde(rename = "type")]
    auth_type: &'static str,
    #[serde(rename = "envkeyIdPart")]
    envkey_id_part: String,
    #[serde(rename = "connectionId")]
    connection_id: String,
}

/// The daemon process: all per-ENVKEY state plus configuration.
pub struct Daemon {
    pub state: DaemonState,
    should_cache: bool,
    exit_when_idle: bool,
}

impl Daemon {
    pub fn new(should_cache: bool, exit_when_idle: bool) -> Self {
        Daemon {
            state: DaemonState::new(),
            should_cache,
            exit_when_idle,
        }
    }

    /// Serve one `/fetch` call: fetch if this ENVKEY is new or its socket
    /// is down, then encode `{current, previous}` and clear `previous`.
    pub async fn fetch_and_connect(
        self: &Arc<Self>,
        envkey: &str,
        client_name: &str,
        client_version: &str,
        rolling: RollingOptions,
    ) -> Result<Vec<u8>> {
        let (current, _, socket) = self.state.fetch_snapshot(envkey);

        if current.is_none() {
            self.fetch_current(envkey, client_name, client_version)
                .await?;
            self.clone().spawn_socket(
                envkey.to_string(),
                client_name.to_string(),
                client_version.to_string(),
                rolling,
            );
        } else if socket.map(|s| !s.is_connected()).unwrap_or(true) {
            self.fetch_current(envkey, client_name, client_version)
                .await?;
        }

        let (current, previous, _) = self.state.fetch_snapshot(envkey);
        self.state.clear_previous_env(envkey);

        let response = DaemonResponse {
            current_env: current.unwrap_or_default(),
            previous_env: previous.unwrap_or_default(),
        };
        response
            .encode()
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Refetch and install the env, reporting whether it changed. Sleeps a
    /// short random jitter first so a mass update doesn't stampede the
    /// server.
    pub async fn fetch_current(
        &self,
        envkey: &str,
        client_name: &str,
        client_version: &str,
    ) -> Result<bool> {
        let jitter = rand::thread_rng().gen_range(0..FETCH_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let options = FetchOptions {
            should_cache: self.should_cache,
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            ..Default::default()
        };
        let env = fetch_map(envkey, options).await?;

        Ok(self.state.update_env(
            envkey,
            env,
            ClientMeta {
                client_name: client_name.to_string(),
                client_version: client_version.to_string(),
            },
        ))
    }

    fn spawn_socket(
        self: Arc<Self>,
        envkey: String,
        client_name: String,
        client_version: String,
        rolling: RollingOptions,
    ) {
        tokio::spawn(async move {
            if let Err(err) = self
                .socket_loop(&envkey, &client_name, &client_version, rolling)
                .await
            {
                warn!(envkey = id_part(&envkey), error = %err, "websocket loop failed");
            }
        });
    }

    async fn socket_loop(
        self: &Arc<Self>,
        envkey: &str,
        client_name: &str,
        client_version: &str,
        rolling: RollingOptions,
    ) -> Result<()> {
        let parsed: Envkey = envkey.parse()?;
        let endpoint = format!("wss://{}", parsed.host_or_default());

        let auth = serde_json::to_string(&SocketAuth {
            auth_type: "fetchEnvkeySocketAuthParams",
            envkey_id_part: parsed.id_part.clone(),
            connection_id: Uuid::new_v4().to_string(),
        })?;

        let mut handle = ws::connect(endpoint.clone(), auth);
        if !self.state.set_socket(envkey, handle.control()) {
            debug!(envkey = id_part(envkey), "websocket already connected");
            handle.control().close();
            return Ok(());
        }
        info!(envkey = id_part(envkey), %endpoint, "websocket connecting");

        while let Some(event) = handle.next_event().await {
            match event {
                SocketEvent::Message(message) => {
                    if let Err(err) = self
                        .handle_push(envkey, client_name, client_version, &message, rolling)
                        .await
                    {
                        warn!(envkey = id_part(envkey), error = %err, "push handling failed");
                        break;
                    }
                }
                SocketEvent::WillReconnect => {
                    self.state.broadcast(envkey, Notification::WillReconnect);
                }
                SocketEvent::Reconnected => {
                    match self.fetch_current(envkey, client_name, client_version).await {
                        Ok(changed) => {
                            self.state.broadcast(envkey, Notification::Reconnected);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            if changed {
                                self.state.broadcast(envkey, Notification::EnvUpdate);
                            } else {
                                self.state
                                    .broadcast(envkey, Notification::ReconnectedNoChange);
                            }
                        }
                        Err(err) => {
                            warn!(envkey = id_part(envkey), error = %err, "refetch after reconnect failed");
                        }
                    }
                }
                SocketEvent::Invalid => {
                    self.state.broadcast(envkey, Notification::EnvkeyInvalid);
                    break;
                }
                SocketEvent::Throttled => {
                    self.state
                        .broadcast(envkey, Notification::ConnectionThrottled);
                    break;
                }
            }
        }

        info!(envkey = id_part(envkey), "websocket loop stopped");
        self.close_websocket(envkey);
        Ok(())
    }

    /// React to one server push: refetch, then notify subscribers either
    /// immediately or on the rolling-reload schedule.
    async fn handle_push(
        self: &Arc<Self>,
        envkey: &str,
        client_name: &str,
        client_version: &str,
        message: &str,
        rolling: RollingOptions,
    ) -> Result<()> {
        // Hold off while a rolling sequence is still pacing subscribers.
        while self.state.is_rolling(envkey) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let changed = self
            .fetch_current(envkey, client_name, client_version)
            .await?;
        debug!(envkey = id_part(envkey), changed, "fetched after push");

        if !changed {
            return Ok(());
        }

        if rolling.rolling_reload {
            match rolling::batch_info(message, rolling.rolling_pct) {
                Ok(Some((batch, total))) if total > 1 => {
                    self.state
                        .broadcast(envkey, Notification::StartRolling { batch, total });
                    self.state.set_rolling(envkey, true);
                    self.clone().spawn_rolling_timers(
                        envkey.to_string(),
                        batch,
                        total,
                        rolling.watch_throttle,
                    );
                }
                Ok(_) => {
                    self.state.broadcast(envkey, Notification::EnvUpdate);
                }
                Err(err) => {
                    return Err(Error::Serialization(err.to_string()));
                }
            }
        } else {
            self.state.broadcast(envkey, Notification::EnvUpdate);
        }

        Ok(())
    }

    /// Deliver `env_update` after this connection's batch slot and
    /// `rolling_complete` once every batch has had its window.
    fn spawn_rolling_timers(self: Arc<Self>, envkey: String, batch: u16, total: u16, throttle_ms: u32) {
        tokio::spawn(async move {
            let batch_wait = u64::from(throttle_ms) * u64::from(batch);
            let total_wait = u64::from(throttle_ms) * u64::from(total);

            tokio::time::sleep(Duration::from_millis(batch_wait.max(1))).await;
            self.state.broadcast(&envkey, Notification::EnvUpdate);

            tokio::time::sleep(Duration::from_millis((total_wait - batch_wait).max(1))).await;
            self.state.broadcast(&envkey, Notification::RollingComplete);

            self.state.set_rolling(&envkey, false);
        });
    }

    /// Tear down everything for an ENVKEY. When nothing remains live, the
    /// daemon has no reason to exist.
    pub(crate) fn close_websocket(&self, envkey: &str) {
        if let Some(record) = self.state.remove_record(envkey) {
            info!(envkey = id_part(envkey), "websocket closing");
            if let Some(socket) = record.socket {
                socket.close();
            }
            if !record.subscribers.is_empty() {
                info!(
                    count = record.subscribers.len(),
                    "closing tcp subscriber connections"
                );
            }
            // Dropping the senders ends each subscriber's writer task,
            // which closes its connection.
        }

        if self.exit_when_idle && self.state.socket_count() == 0 {
            info!("no socket connections remaining; stopping daemon");
            std::process::exit(0);
        }
    }

    /// Accept TCP subscribers on the notification port.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let daemon = self.clone();
                    tokio::spawn(daemon.handle_tcp_connection(stream));
                }
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                }
            }
        }
    }

    async fn handle_tcp_connection(self: Arc<Self>, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let composite = line.trim();
        let (envkey, connection_id) = match composite.split_once('|') {
            Some(parts) => (parts.0.to_string(), parts.1.to_string()),
            None => return,
        };

        // Subscribing requires a prior `/fetch`; otherwise just close.
        let (sender, mut notifications) = tokio::sync::mpsc::unbounded_channel();
        if !self.state.add_subscriber(&envkey, &connection_id, sender) {
            info!(
                envkey = id_part(&envkey),
                connection_id, "tcp subscriber rejected: no current env"
            );
            return;
        }
        info!(envkey = id_part(&envkey), connection_id, "tcp subscriber connected");

        let mut discard = String::new();
        loop {
            tokio::select! {
                notification = notifications.recv() => match notification {
                    Some(notification) => {
                        let frame = format!("{}\n", notification.as_line());
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    // Record torn down; the connection goes with it.
                    None => break,
                },
                read = reader.read_line(&mut discard) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => discard.clear(),
                }
            }
        }

        info!(envkey = id_part(&envkey), connection_id, "tcp subscriber closing");
        let removal = self.state.remove_subscriber(&envkey, &connection_id);
        if removal.last_for_envkey && self.state.socket(&envkey).is_some() {
            self.close_websocket(&envkey);
        }
    }

    /// Detect wall-clock jumps from laptop sleep and revalidate every live
    /// ENVKEY when one happens.
    pub async fn watch_suspension(self: Arc<Self>) {
        let interval = Duration::from_secs(SUSPENSION_CHECK_INTERVAL_SECS);
        let tolerance = Duration::from_millis(SUSPENSION_TOLERANCE_MS);

        loop {
            let before = Instant::now();
            tokio::time::sleep(interval).await;

            let elapsed = before.elapsed();
            if elapsed <= interval + tolerance {
                continue;
            }
            info!(
                elapsed_ms = elapsed.as_millis() as u64,
                "process was suspended; revalidating"
            );

            for (envkey, meta) in self.state.live_envkeys() {
                let daemon = self.clone();
                tokio::spawn(async move {
                    daemon.state.broadcast(&envkey, Notification::Suspended);
                    match daemon
                        .fetch_current(&envkey, &meta.client_name, &meta.client_version)
                        .await
                    {
                        Ok(true) => {
                            daemon.state.broadcast(&envkey, Notification::EnvUpdate);
                        }
                        Ok(false) => {
                            daemon
                                .state
                                .broadcast(&envkey, Notification::SuspendedNoChange);
                        }
                        Err(err) => {
                            warn!(envkey = id_part(&envkey), error = %err, "revalidation failed");
                            if let Some(socket) = daemon.state.socket(&envkey) {
                                socket.close_and_reconnect();
                            }
                        }
                    }
                });
            }
        }
    }
}

/// Run the daemon in the foreground: rotating file logging, TCP + HTTP
/// servers, suspension watcher, and ignored termination signals. Never
/// returns except on bind failure.
pub async fn inline_start(should_cache: bool) -> Result<()> {
    let _log_guard = init_logging()?;

    let daemon = Arc::new(Daemon::new(should_cache, true));

    let tcp_listener = TcpListener::bind(("127.0.0.1", DAEMON_TCP_PORT)).await?;
    tokio::spawn(daemon.clone().serve_tcp(tcp_listener));
    tokio::spawn(daemon.clone().watch_suspension());

    ignore_termination_signals();

    crate::http::serve(daemon).await
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use envkey_core::defaults::{DAEMON_LOG_FILE, ENVKEY_DIR, LOG_DIR};

    let log_dir = dirs::home_dir()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot resolve home directory",
            ))
        })?
        .join(ENVKEY_DIR)
        .join(LOG_DIR);
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, DAEMON_LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

/// The daemon outlives the shell that started it; termination is by
/// `/stop` or by the last subscriber disconnecting, not by signals.
fn ignore_termination_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        for kind in [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::quit(),
        ] {
            if let Ok(mut stream) = signal(kind) {
                tokio::spawn(async move {
                    loop {
                        stream.recv().await;
                        debug!("ignoring termination signal");
                    }
                });
            }
        }
    }
}
