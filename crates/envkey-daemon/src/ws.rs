//! Reconnecting websocket client for the server's push channel.
//!
//! One background task owns the dial loop; the daemon consumes a stream of
//! [`SocketEvent`]s instead of registering callbacks. Close-code
//! classification is centralized here: 4001 (or handshake 401/404) is
//! terminal-invalid, 4002 (or handshake 429) is terminal-throttled,
//! everything else redials with jittered exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use http::HeaderValue;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use envkey_core::defaults::{
    WS_BACKOFF_FACTOR, WS_BACKOFF_MAX_SECS, WS_BACKOFF_MIN_SECS, WS_PING_INTERVAL_SECS,
};

/// Lifecycle and data events surfaced to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// An inbound text frame. Empty text is the legacy "env changed"
    /// signal; `n|m` carries rolling-reload batch info.
    Message(String),
    /// A reconnect attempt is pending.
    WillReconnect,
    /// The connection came back after a drop.
    Reconnected,
    /// The server rejected the credential. Terminal.
    Invalid,
    /// The server rejected the connection for rate limiting. Terminal.
    Throttled,
}

/// Shared control surface for a socket task.
#[derive(Clone)]
pub struct SocketControl {
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    reconnect_notify: Arc<Notify>,
}

impl SocketControl {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the task has stopped for good (terminal event or close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the socket permanently.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_one();
    }

    /// Drop the current connection and redial.
    pub fn close_and_reconnect(&self) {
        self.reconnect_notify.notify_one();
    }
}

/// The consumer half of a socket: an event stream plus its control handle.
pub struct SocketHandle {
    events: mpsc::UnboundedReceiver<SocketEvent>,
    control: SocketControl,
}

impl SocketHandle {
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    pub fn control(&self) -> SocketControl {
        self.control.clone()
    }
}

/// Dial `url` with the given `authorization` header value and keep the
/// connection alive until a terminal close.
pub fn connect(url: String, authorization: String) -> SocketHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let control = SocketControl {
        connected: Arc::new(AtomicBool::new(false)),
        closed: Arc::new(AtomicBool::new(false)),
        close_notify: Arc::new(Notify::new()),
        reconnect_notify: Arc::new(Notify::new()),
    };

    tokio::spawn(run(url, authorization, events_tx, control.clone()));

    SocketHandle {
        events: events_rx,
        control,
    }
}

enum DialError {
    Invalid,
    Throttled,
    Transient(String),
}

enum Drive {
    /// Connection dropped; redial.
    Retry,
    /// Permanent stop requested via `close()`.
    Closed,
    Terminal(SocketEvent),
}

async fn run(
    url: String,
    authorization: String,
    events: mpsc::UnboundedSender<SocketEvent>,
    control: SocketControl,
) {
    let mut backoff = Backoff::new();
    let mut had_connection = false;
    let mut will_reconnect_debounce = Debounce::new();
    let mut reconnected_debounce = Debounce::new();

    loop {
        if control.is_closed() {
            return;
        }

        match dial(&url, &authorization).await {
            Ok(stream) => {
                backoff.reset();
                control.connected.store(true, Ordering::SeqCst);
                if had_connection && reconnected_debounce.allow() {
                    let _ = events.send(SocketEvent::Reconnected);
                }
                had_connection = true;

                let outcome = drive(stream, &events, &control).await;
                control.connected.store(false, Ordering::SeqCst);

                match outcome {
                    Drive::Closed => {
                        control.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                    Drive::Terminal(event) => {
                        control.closed.store(true, Ordering::SeqCst);
                        let _ = events.send(event);
                        return;
                    }
                    Drive::Retry => {
                        if will_reconnect_debounce.allow() {
                            let _ = events.send(SocketEvent::WillReconnect);
                        }
                    }
                }
            }
            Err(DialError::Invalid) => {
                control.closed.store(true, Ordering::SeqCst);
                let _ = events.send(SocketEvent::Invalid);
                return;
            }
            Err(DialError::Throttled) => {
                control.closed.store(true, Ordering::SeqCst);
                let _ = events.send(SocketEvent::Throttled);
                return;
            }
            Err(DialError::Transient(reason)) => {
                debug!(%url, %reason, "websocket dial failed");
                if will_reconnect_debounce.allow() {
                    let _ = events.send(SocketEvent::WillReconnect);
                }
            }
        }

        let delay = backoff.next();
        tokio::select! {
            _ = control.close_notify.notified() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn dial(
    url: &str,
    authorization: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, DialError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| DialError::Transient(e.to_string()))?;
    let header = HeaderValue::from_str(authorization)
        .map_err(|e| DialError::Transient(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, header);

    match connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(WsError::Http(response)) => match response.status().as_u16() {
            401 | 404 => Err(DialError::Invalid),
            429 => Err(DialError::Throttled),
            code => Err(DialError::Transient(format!("handshake status {code}"))),
        },
        Err(err) => Err(DialError::Transient(err.to_string())),
    }
}

async fn drive(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: &mpsc::UnboundedSender<SocketEvent>,
    control: &SocketControl,
) -> Drive {
    let (mut sink, mut source) = stream.split();
    let ping_interval = Duration::from_secs(WS_PING_INTERVAL_SECS);
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first ping lands one
    // interval after connect.
    ping.tick().await;

    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = control.close_notify.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return Drive::Closed;
            }
            _ = control.reconnect_notify.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return Drive::Retry;
            }
            _ = ping.tick() => {
                if let Some(sent) = awaiting_pong {
                    if sent.elapsed() >= ping_interval {
                        debug!("pong deadline missed; dropping connection");
                        return Drive::Retry;
                    }
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return Drive::Retry;
                }
                if awaiting_pong.is_none() {
                    awaiting_pong = Some(Instant::now());
                }
            }
            frame = source.next() => match frame {
                None => return Drive::Retry,
                Some(Err(err)) => {
                    debug!(error = %err, "websocket read failed");
                    return Drive::Retry;
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Message(text));
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = None;
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame.map(|f| u16::from(f.code)) {
                        Some(4001) => Drive::Terminal(SocketEvent::Invalid),
                        Some(4002) => Drive::Terminal(SocketEvent::Throttled),
                        _ => Drive::Retry,
                    };
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Jittered exponential backoff between dial attempts.
struct Backoff {
    current: f64,
}

impl Backoff {
    fn new() -> Self {
        Backoff {
            current: WS_BACKOFF_MIN_SECS as f64,
        }
    }

    fn reset(&mut self) {
        self.current = WS_BACKOFF_MIN_SECS as f64;
    }

    fn next(&mut self) -> Duration {
        let jittered = self.current / 2.0 + rand::thread_rng().gen::<f64>() * (self.current / 2.0);
        self.current = (self.current * WS_BACKOFF_FACTOR).min(WS_BACKOFF_MAX_SECS as f64);
        Duration::from_secs_f64(jittered)
    }
}

/// At most one event per second, so a flapping link doesn't spam
/// subscribers with reconnect chatter.
struct Debounce {
    last: Option<Instant>,
}

impl Debounce {
    fn new() -> Self {
        Debounce { last: None }
    }

    fn allow(&mut self) -> bool {
        match self.last {
            Some(at) if at.elapsed() < Duration::from_secs(1) => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}
