//! # envkey-daemon
//!
//! The per-host background process that keeps environments live: one
//! reconnecting websocket per distinct ENVKEY, a loopback HTTP control
//! surface for the foreground CLI, and a line-delimited TCP stream that
//! pushes change notifications to subscribed clients.
//!
//! The [`ipc`] module is the daemon's public IPC contract; the client
//! library depends on it and nothing else here.

pub mod daemon;
pub mod http;
pub mod ipc;
pub mod rolling;
pub mod state;
pub mod ws;

pub use daemon::{inline_start, Daemon, RollingOptions};
pub use http::DAEMON_VERSION;
pub use ipc::{http_base, tcp_addr, DaemonResponse, Notification};
pub use rolling::batch_info;
pub use ws::{SocketControl, SocketEvent, SocketHandle};
