//! Child-process supervision for exec and watch modes.
//!
//! One supervisor owns the watched child and the reload policy: changes
//! arriving faster than the throttle window are coalesced latest-wins, a
//! stopped child gets SIGTERM then SIGKILL after a grace period, and
//! termination signals to this process are forwarded before exiting.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use envkey_core::defaults::EXIT_SIGNAL_TIMEOUT_SECS;
use envkey_core::EnvMap;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::shell;

/// Spawn `command` through the shell with the env applied on top of the
/// inherited environment.
pub fn spawn_command(
    command: &str,
    env: &EnvMap,
    previous: Option<&EnvMap>,
    force: bool,
) -> Result<Child> {
    let pairs = shell::child_env(env, previous, force);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .envs(pairs)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    cmd.spawn()
        .with_context(|| format!("failed to execute: {command}"))
}

/// Stop a child politely: SIGTERM, a grace period, then SIGKILL. Waits for
/// the process to be fully reaped.
pub async fn stop_child(mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    let grace = Duration::from_secs(EXIT_SIGNAL_TIMEOUT_SECS);
    tokio::select! {
        _ = child.wait() => {}
        _ = tokio::time::sleep(grace) => {
            debug!("grace period expired; killing child");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill child");
            }
            let _ = child.wait().await;
        }
    }
}

/// Latest-wins coalescing of change events under a throttle window.
///
/// The first change in a window fires immediately and opens the window;
/// later changes replace the queued pair. When the window expires the
/// queued change (if any) replays.
pub struct ChangeThrottle {
    window: Duration,
    queued: Option<(EnvMap, EnvMap)>,
    throttling: bool,
}

impl ChangeThrottle {
    pub fn new(window_ms: u32) -> Self {
        ChangeThrottle {
            window: Duration::from_millis(u64::from(window_ms)),
            queued: None,
            throttling: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offer a fresh change. `Some` hands it back for immediate action and
    /// opens the window; `None` means it was coalesced behind the window.
    pub fn offer(&mut self, current: EnvMap, previous: EnvMap) -> Option<(EnvMap, EnvMap)> {
        if self.throttling {
            self.queued = Some((current, previous));
            None
        } else {
            self.throttling = true;
            Some((current, previous))
        }
    }

    /// Close the window. Returns the queued change to replay, which also
    /// reopens the window when present.
    pub fn expire(&mut self) -> Option<(EnvMap, EnvMap)> {
        self.throttling = false;
        let queued = self.queued.take();
        if queued.is_some() {
            self.throttling = true;
        }
        queued
    }

    pub fn is_throttling(&self) -> bool {
        self.throttling
    }
}

/// Whether a change touches any of the watched vars. An empty watch list
/// matches everything.
pub fn watched_var_changed(only: &[String], current: &EnvMap, previous: &EnvMap) -> bool {
    if only.is_empty() {
        return true;
    }
    only.iter().any(|key| {
        let key = key.trim();
        current.get(key) != previous.get(key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_throttle_first_change_fires_immediately() {
        let mut throttle = ChangeThrottle::new(1000);
        let fired = throttle.offer(env_of(&[("A", "1")]), EnvMap::new());
        assert!(fired.is_some());
        assert!(throttle.is_throttling());
    }

    #[test]
    fn test_throttle_coalesces_latest_wins() {
        let mut throttle = ChangeThrottle::new(1000);
        throttle.offer(env_of(&[("A", "1")]), EnvMap::new());

        assert!(throttle
            .offer(env_of(&[("A", "2")]), env_of(&[("A", "1")]))
            .is_none());
        assert!(throttle
            .offer(env_of(&[("A", "3")]), env_of(&[("A", "2")]))
            .is_none());

        // Only the latest queued pair survives the window.
        let (current, previous) = throttle.expire().unwrap();
        assert_eq!(current, env_of(&[("A", "3")]));
        assert_eq!(previous, env_of(&[("A", "2")]));

        // Replaying reopened the window.
        assert!(throttle.is_throttling());
        assert!(throttle.expire().is_none());
        assert!(!throttle.is_throttling());
    }

    #[test]
    fn test_throttle_expire_without_queued_closes_window() {
        let mut throttle = ChangeThrottle::new(1000);
        throttle.offer(env_of(&[("A", "1")]), EnvMap::new());
        assert!(throttle.expire().is_none());
        assert!(!throttle.is_throttling());

        // The next change fires immediately again.
        assert!(throttle
            .offer(env_of(&[("A", "2")]), env_of(&[("A", "1")]))
            .is_some());
    }

    #[test]
    fn test_watched_var_filter() {
        let previous = env_of(&[("WATCHED", "1"), ("OTHER", "x")]);
        let current = env_of(&[("WATCHED", "1"), ("OTHER", "y")]);

        assert!(!watched_var_changed(
            &["WATCHED".to_string()],
            &current,
            &previous
        ));
        assert!(watched_var_changed(&[], &current, &previous));
        assert!(watched_var_changed(
            &["OTHER".to_string()],
            &current,
            &previous
        ));
        assert!(watched_var_changed(
            &[" WATCHED ".to_string(), "OTHER".to_string()],
            &current,
            &previous
        ));
    }

    #[tokio::test]
    async fn test_spawn_and_stop_child() {
        let child = spawn_command("sleep 30", &EnvMap::new(), None, false).unwrap();
        let started = std::time::Instant::now();
        stop_child(child).await;
        // SIGTERM ends sleep well before the grace period.
        assert!(started.elapsed() < Duration::from_secs(EXIT_SIGNAL_TIMEOUT_SECS));
    }

    #[tokio::test]
    async fn test_child_sees_env() {
        let mut child = spawn_command(
            "test \"$ENVKEY_TEST_CHILD_VAR\" = expected",
            &env_of(&[("ENVKEY_TEST_CHILD_VAR", "expected")]),
            None,
            true,
        )
        .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
