//! envkey-source: set environment variables from an EnvKey ENVKEY, with
//! optional live reloads of a wrapped command.

mod shell;
mod watch;

use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::process::Child;
use tracing::debug;

use envkey_client::{self as client, ChangeEvent};
use envkey_core::defaults::{DEFAULT_ROLLING_PCT, DEFAULT_WATCH_THROTTLE_MS};
use envkey_core::{EnvMap, FetchOptions};

#[derive(Parser, Debug)]
#[command(
    name = "envkey-source",
    version,
    about = "Sets environment variables from an EnvKey ENVKEY",
    after_help = "Arguments after -- are executed with the environment applied.\n\
                  The ENVKEY credential is read from the ENVKEY environment variable."
)]
struct Cli {
    /// Re-run the command whenever the environment is updated
    #[arg(short = 'w', long)]
    watch: bool,

    /// Command to execute when the environment is updated
    #[arg(short = 'r', long = "on-reload")]
    on_reload: Option<String>,

    /// With -w or -r, reload only when specific vars change (comma-delimited)
    #[arg(long = "only", value_delimiter = ',')]
    only: Vec<String>,

    /// Min delay in ms between reloads with -w, -r, or --rolling
    #[arg(long, default_value_t = DEFAULT_WATCH_THROTTLE_MS)]
    throttle: u32,

    /// No-downtime rolling reloads across all connected processes
    #[arg(long)]
    rolling: bool,

    /// Min % of connected processes to reload in each batch with --rolling
    #[arg(long = "rolling-pct", default_value_t = DEFAULT_ROLLING_PCT)]
    rolling_pct: u8,

    /// Overwrite existing environment variables
    #[arg(short = 'f', long)]
    force: bool,

    /// Cache encrypted config on disk as a local backup for offline work
    #[arg(short = 'c', long)]
    cache: bool,

    /// Cache directory (default is $HOME/.envkey/cache)
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Keep an in-memory cache up-to-date for zero-latency fetches
    #[arg(short = 'm', long = "mem-cache")]
    mem_cache: bool,

    /// Print a hook for shell config to automatically sync on directory change
    #[arg(long)]
    hook: Option<String>,

    /// Kill the daemon process if it's running
    #[arg(long)]
    kill: bool,

    /// Unset all EnvKey vars in the current shell (eval $(envkey-source --unset))
    #[arg(long)]
    unset: bool,

    /// Don't output an error if the ENVKEY is missing
    #[arg(long = "ignore-missing")]
    ignore_missing: bool,

    /// Print verbose output
    #[arg(long)]
    verbose: bool,

    /// Timeout in seconds for http requests
    #[arg(long, default_value_t = 20.0)]
    timeout: f64,

    /// Number of times to retry requests on failure
    #[arg(long, default_value_t = 3)]
    retries: u8,

    /// Retry backoff factor: {retry-backoff} * (2 ^ {retries - 1})
    #[arg(long = "retry-backoff", default_value_t = 1.0)]
    retry_backoff: f64,

    /// Change output to be compatible with /etc/environment on Linux
    #[arg(long)]
    pam: bool,

    /// Change output to .env format
    #[arg(long = "dot-env")]
    dot_env: bool,

    /// Change output to json format
    #[arg(long)]
    json: bool,

    /// Change output to yaml format
    #[arg(long)]
    yaml: bool,

    /// Client name for logging when wrapped by another SDK
    #[arg(long = "client-name")]
    client_name: Option<String>,

    /// Client version for logging when wrapped by another SDK
    #[arg(long = "client-version")]
    client_version: Option<String>,

    /// Run as the background daemon
    #[arg(long, hide = true)]
    daemon: bool,

    /// Command to execute with the environment applied
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !cli.daemon {
        // The daemon sets up its own rotating file logging instead.
        let filter = if cli.verbose { "debug" } else { "warn" };
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("envkey-source: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    if cli.daemon {
        envkey_daemon::inline_start(cli.cache)
            .await
            .context("daemon failed")?;
        return Ok(0);
    }

    if cli.kill {
        client::stop().await;
        return Ok(0);
    }

    if let Some(shell_name) = &cli.hook {
        print!("{}", hook_snippet(shell_name));
        return Ok(0);
    }

    if cli.unset {
        println!("{}", shell::unload());
        return Ok(0);
    }

    let envkey = match std::env::var("ENVKEY") {
        Ok(envkey) if !envkey.is_empty() => envkey,
        _ => {
            if cli.ignore_missing {
                return Ok(0);
            }
            bail!("ENVKEY missing - set the ENVKEY environment variable");
        }
    };

    let client_name = cli
        .client_name
        .clone()
        .unwrap_or_else(|| "envkey-source".to_string());
    let client_version = cli
        .client_version
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    let command = if cli.command.is_empty() {
        None
    } else {
        Some(cli.command.join(" "))
    };
    let watching = cli.watch || cli.on_reload.is_some();

    // Watch modes and the in-memory cache need the daemon; a plain print
    // or one-shot exec fetches directly.
    let current = if watching || cli.mem_cache {
        client::launch_detached_if_needed()
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let (current, _) = client::fetch_map_with(
            &envkey,
            &client_name,
            &client_version,
            cli.rolling,
            cli.rolling_pct,
            cli.throttle,
        )
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
        current
    } else {
        envkey_core::fetch_map(
            &envkey,
            FetchOptions {
                should_cache: cli.cache,
                cache_dir: cli.cache_dir.clone(),
                client_name: client_name.clone(),
                client_version: client_version.clone(),
                verbose: cli.verbose,
                timeout_seconds: cli.timeout,
                retries: cli.retries,
                retry_backoff: cli.retry_backoff,
            },
        )
        .await?
    };

    if command.is_none() && cli.on_reload.is_none() {
        println!("{}", render(&current, &cli)?);
        return Ok(0);
    }

    exec_with_env(cli, envkey, client_name, client_version, command, current).await
}

fn render(env: &EnvMap, cli: &Cli) -> Result<String> {
    if cli.json {
        Ok(serde_json::to_string(env)?)
    } else if cli.yaml {
        Ok(serde_yaml::to_string(env)?)
    } else {
        Ok(shell::source(env, cli.force, cli.pam, cli.dot_env))
    }
}

async fn exec_with_env(
    cli: Cli,
    envkey: String,
    client_name: String,
    client_version: String,
    command: Option<String>,
    current: EnvMap,
) -> Result<i32> {
    let watching = cli.watch || cli.on_reload.is_some();

    let mut child: Option<Child> = match &command {
        Some(command) => Some(watch::spawn_command(command, &current, None, cli.force)?),
        None => None,
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    if !watching {
        // One-shot exec: wait for the child, forwarding termination.
        let mut child = child.ok_or_else(|| anyhow!("no command to execute"))?;
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::signal::ctrl_c() => None,
            _ = sigterm.recv() => None,
        };
        return match status {
            Some(status) => Ok(status.code().unwrap_or(1)),
            None => {
                watch::stop_child(child).await;
                Ok(130)
            }
        };
    }

    let mut listener = client::listen_change(&envkey)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    let mut throttle = watch::ChangeThrottle::new(cli.throttle);
    let mut window: Option<Pin<Box<tokio::time::Sleep>>> = None;

    eprintln!("envkey-source | watching for changes...");

    loop {
        tokio::select! {
            event = listener.next_event() => match event {
                None | Some(ChangeEvent::LostDaemonConnection) => {
                    bail!("lost connection to envkey daemon");
                }
                Some(ChangeEvent::Change) => {
                    let (current, previous) =
                        client::fetch_map(&envkey, &client_name, &client_version)
                            .await
                            .map_err(|e| anyhow!("couldn't fetch latest env: {e}"))?;
                    if let Some((current, previous)) = throttle.offer(current, previous) {
                        window = Some(Box::pin(tokio::time::sleep(throttle.window())));
                        child = apply_change(&cli, &command, child, current, previous).await?;
                    }
                }
                Some(ChangeEvent::Invalid) => {
                    bail!("ENVKEY invalid - watcher will exit");
                }
                Some(ChangeEvent::Throttled) => {
                    bail!("active socket connection limit reached - watcher will exit");
                }
                Some(ChangeEvent::WillReconnect) => {
                    eprintln!("envkey-source | lost connection to EnvKey host - attempting to reconnect...");
                }
                Some(ChangeEvent::Reconnected) => {
                    eprintln!("envkey-source | reconnected to EnvKey host - checking for changes...");
                }
                Some(ChangeEvent::ReconnectedNoChange) | Some(ChangeEvent::SuspendedNoChange) => {
                    eprintln!("envkey-source | nothing changed - waiting for changes...");
                }
                Some(ChangeEvent::Suspended) => {
                    eprintln!("envkey-source | process was suspended - checking for changes...");
                }
                Some(ChangeEvent::StartRolling { batch, total }) => {
                    eprintln!("envkey-source | rolling reload: batch {} of {total}", batch + 1);
                }
                Some(ChangeEvent::RollingComplete) => {
                    eprintln!("envkey-source | rolling reload complete");
                }
            },
            _ = async { if let Some(window) = window.as_mut() { window.as_mut().await } }, if window.is_some() => {
                window = None;
                if let Some((current, previous)) = throttle.expire() {
                    window = Some(Box::pin(tokio::time::sleep(throttle.window())));
                    child = apply_change(&cli, &command, child, current, previous).await?;
                }
            },
            status = async {
                match child.as_mut() {
                    Some(child) => child.wait().await,
                    None => std::future::pending().await,
                }
            }, if child.is_some() => {
                debug!(?status, "command finished; still watching for changes");
                child = None;
            },
            _ = tokio::signal::ctrl_c() => {
                if let Some(child) = child.take() {
                    watch::stop_child(child).await;
                }
                return Ok(130);
            },
            _ = sigterm.recv() => {
                if let Some(child) = child.take() {
                    watch::stop_child(child).await;
                }
                return Ok(130);
            },
        }
    }
}

/// Run the per-change actions: the `--on-reload` side command, and a
/// restart of the watched command.
async fn apply_change(
    cli: &Cli,
    command: &Option<String>,
    child: Option<Child>,
    current: EnvMap,
    previous: EnvMap,
) -> Result<Option<Child>> {
    if !watch::watched_var_changed(&cli.only, &current, &previous) {
        debug!("no watched vars changed; skipping reload");
        return Ok(child);
    }

    if let Some(on_reload) = &cli.on_reload {
        let mut side = watch::spawn_command(on_reload, &current, Some(&previous), cli.force)?;
        tokio::spawn(async move {
            let _ = side.wait().await;
        });
    }

    if let Some(command) = command {
        if cli.watch {
            eprintln!("envkey-source | reloading after update...");
            if let Some(old) = child {
                watch::stop_child(old).await;
            }
            let fresh = watch::spawn_command(command, &current, Some(&previous), cli.force)?;
            return Ok(Some(fresh));
        }
    }

    Ok(child)
}

fn hook_snippet(shell_name: &str) -> String {
    let hook = r#"_envkey_source_hook() {
    if [ -n "$ENVKEY" ] || [ -n "$__ENVKEY_LOADED" ]; then
        eval "$(envkey-source --ignore-missing)"
    fi
}
"#;

    match shell_name {
        "zsh" => format!(
            "{hook}typeset -ag precmd_functions\n\
             if [[ -z \"${{precmd_functions[(r)_envkey_source_hook]}}\" ]]; then\n    \
             precmd_functions=( _envkey_source_hook ${{precmd_functions[@]}} )\nfi\n"
        ),
        _ => format!(
            "{hook}if [[ \"$PROMPT_COMMAND\" != *\"_envkey_source_hook\"* ]]; then\n    \
             PROMPT_COMMAND=\"_envkey_source_hook${{PROMPT_COMMAND:+;$PROMPT_COMMAND}}\"\nfi\n"
        ),
    }
}
