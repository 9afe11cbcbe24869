//! The daemon's loopback HTTP control surface.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use envkey_core::defaults::DAEMON_HTTP_PORT;
use envkey_core::{id_part, Result};

use crate::daemon::{Daemon, RollingOptions};

/// Version string reported by `/alive`.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/alive", get(alive))
        .route("/stop", get(stop))
        .route(
            "/fetch/:envkey/:client_name/:client_version/:rolling_reload/:rolling_pct/:watch_throttle",
            get(fetch),
        )
        .with_state(daemon)
}

/// Bind and serve until the process exits.
pub async fn serve(daemon: Arc<Daemon>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", DAEMON_HTTP_PORT)).await?;
    info!(port = DAEMON_HTTP_PORT, "daemon http listening");
    axum::serve(listener, router(daemon))
        .await
        .map_err(Into::into)
}

async fn alive() -> String {
    format!("envkey-source daemon v{DAEMON_VERSION}")
}

async fn stop() -> &'static str {
    info!("stop requested; daemon exiting");
    // Let the response flush before the process goes away.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(0);
    });
    "envkey-source daemon stopped"
}

#[allow(clippy::type_complexity)]
async fn fetch(
    State(daemon): State<Arc<Daemon>>,
    Path((envkey, client_name, client_version, rolling_reload, rolling_pct, watch_throttle)): Path<(
        String,
        String,
        String,
        bool,
        u8,
        u32,
    )>,
) -> axum::response::Response {
    if envkey.is_empty() {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    info!(envkey = id_part(&envkey), "fetching env");

    let rolling = RollingOptions {
        rolling_reload,
        rolling_pct,
        watch_throttle,
    };

    match daemon
        .fetch_and_connect(&envkey, &client_name, &client_version, rolling)
        .await
    {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(err) => {
            info!(envkey = id_part(&envkey), error = %err, "fetch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Fetch error: {err}")).into_response()
        }
    }
}
