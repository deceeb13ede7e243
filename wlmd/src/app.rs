//! Process entry flow: arbitrate, then forward, serve, or run one command.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use wlmd_client::{ChannelClient, Reply};

use crate::channel::ChannelServer;
use crate::config::Config;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::instance::InstanceLock;
use crate::lifecycle::{spawn_signal_handlers, LifecycleCoordinator, StopHandle};
use crate::notify::SdNotifier;
use crate::process::ProcessController;
use crate::service::SystemdServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    Failure,
}

impl From<bool> for Exit {
    fn from(success: bool) -> Self {
        if success {
            Exit::Success
        } else {
            Exit::Failure
        }
    }
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        match exit {
            Exit::Success => ExitCode::SUCCESS,
            Exit::Failure => ExitCode::FAILURE,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub service_mode: bool,
    pub command: Option<String>,
    pub config_path: Option<PathBuf>,
}

pub async fn run(config: &Config, invocation: Invocation) -> Result<Exit> {
    let mut lock = InstanceLock::try_acquire(&config.instance.lock)
        .context("instance arbitration failed")?;

    if !lock.is_first_instance() && invocation.service_mode {
        lock = claim_for_service(&config.instance.lock, config.service.claim_timeout()).await?;
        if !lock.is_first_instance() {
            error!(
                lock = %lock.name().display(),
                owner = ?lock.owner_pid(),
                "Instance lock still held; refusing to start the service"
            );
            eprintln!("Another instance holds {}; service not started", lock.name().display());
            return Ok(Exit::Failure);
        }
    }

    if !lock.is_first_instance() {
        info!(
            lock = %lock.name().display(),
            owner = ?lock.owner_pid(),
            "Another instance owns the command channel"
        );
        return Ok(forward(config, invocation.command.as_deref()).await);
    }

    let dispatcher = Arc::new(build_dispatcher(config, invocation.config_path.as_deref())?);
    let exit = if invocation.service_mode {
        run_service(config, dispatcher).await?
    } else {
        run_console(config, dispatcher, invocation.command.as_deref()).await
    };

    drop(lock);
    Ok(exit)
}

const CLAIM_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Service mode never forwards. The owner it lost to is usually a console
/// instance that just ran `--start` and is on its way out, so keep retrying
/// until `window` has passed.
async fn claim_for_service(path: &Path, window: Duration) -> Result<InstanceLock> {
    info!(lock = %path.display(), "Instance lock busy; waiting to start the service");
    let deadline = Instant::now() + window;
    loop {
        tokio::time::sleep(CLAIM_RETRY_INTERVAL).await;
        let lock = InstanceLock::try_acquire(path).context("instance arbitration failed")?;
        if lock.is_first_instance() || Instant::now() >= deadline {
            return Ok(lock);
        }
    }
}

/// Second-instance path: hand the command to the owner and relay its reply.
async fn forward(config: &Config, command: Option<&str>) -> Exit {
    let Some(command) = command else {
        println!("Another instance is running; no command to forward");
        return Exit::Success;
    };

    println!("Another instance is running; forwarding command...");
    let client = ChannelClient::new(&config.channel.socket);
    match client.send_command(command).await {
        Ok(reply) => {
            println!("{}", reply);
            Exit::from(Reply::parse(&reply).is_success())
        }
        Err(err) => {
            eprintln!("Could not reach the running instance: {}", err);
            Exit::Failure
        }
    }
}

fn build_dispatcher(config: &Config, config_path: Option<&Path>) -> Result<Dispatcher> {
    let exe = std::env::current_exe().context("cannot resolve own executable path")?;
    let mut exec_start = format!("{} --service", exe.display());
    if let Some(path) = config_path {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        exec_start.push_str(&format!(" --config {}", path.display()));
    }

    let service = SystemdServiceManager::new(&config.service.name, &config.service.unit_dir);
    Ok(Dispatcher::new(
        Arc::new(ProcessController::default()),
        Arc::new(service),
        DispatchSettings::from_config(config, exec_start),
    ))
}

fn channel_server(config: &Config) -> ChannelServer {
    ChannelServer::new(&config.channel.socket)
        .with_stop_timeout(config.channel.stop_timeout())
        .with_read_timeout(config.channel.read_timeout())
}

async fn run_service(config: &Config, dispatcher: Arc<Dispatcher>) -> Result<Exit> {
    info!(service = %config.service.name, "Running in service mode");
    let coordinator = LifecycleCoordinator::new(
        channel_server(config),
        Some(dispatcher),
        Arc::new(SdNotifier::from_env()),
        config.service.poll_interval(),
    );
    spawn_signal_handlers(coordinator.stop_handle());
    coordinator.run().await.context("service lifecycle")?;
    Ok(Exit::Success)
}

/// First instance started from a terminal. The channel runs for as long as
/// this process does, so commands can be forwarded to it meanwhile.
async fn run_console(config: &Config, dispatcher: Arc<Dispatcher>, command: Option<&str>) -> Exit {
    let (stop, stop_rx) = StopHandle::new();
    spawn_signal_handlers(stop);

    let mut server = channel_server(config);
    if let Err(err) = server.start(Some(dispatcher.clone())) {
        error!(endpoint = %config.channel.socket.display(), "Failed to start command channel: {}", err);
        eprintln!("Failed to start command channel: {}", err);
        return Exit::Failure;
    }

    let exit = match command {
        Some(command) => {
            let outcome = dispatcher.dispatch(command).await;
            if outcome.success {
                println!("{}", outcome.output);
            } else {
                eprintln!("{}", outcome.output);
            }
            Exit::from(outcome.success)
        }
        None => {
            println!(
                "Command channel listening on {}; press Enter or Ctrl+C to exit",
                config.channel.socket.display()
            );
            wait_for_exit(stop_rx).await;
            Exit::Success
        }
    };

    server.stop().await;
    exit
}

async fn wait_for_exit(mut stop_rx: watch::Receiver<bool>) {
    let enter = spawn_enter_watcher();

    tokio::select! {
        _ = stop_rx.wait_for(|stop| *stop) => {}
        _ = enter_pressed(enter) => info!("Enter pressed; exiting"),
    }
}

/// Blocking stdin read on a detached thread, so a pending read never holds
/// up runtime shutdown.
fn spawn_enter_watcher() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("wlmd-stdin".into())
        .spawn(move || {
            let mut line = String::new();
            if let Ok(n) = std::io::stdin().read_line(&mut line) {
                if n > 0 {
                    let _ = tx.send(());
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Cannot watch stdin: {}", err);
    }
    rx
}

/// Resolves on a line from stdin; EOF or a closed stdin never resolves.
async fn enter_pressed(enter: oneshot::Receiver<()>) {
    if enter.await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.channel.socket = dir.path().join("wlmd.sock");
        config.instance.lock = dir.path().join("wlmd.lock");
        config.service.unit_dir = dir.path().join("units");
        config
    }

    #[test]
    fn exit_maps_from_success() {
        assert_eq!(Exit::from(true), Exit::Success);
        assert_eq!(Exit::from(false), Exit::Failure);
    }

    #[tokio::test]
    async fn forward_without_owner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        assert_eq!(forward(&config, Some("--status")).await, Exit::Failure);
        assert_eq!(forward(&config, None).await, Exit::Success);
    }

    #[tokio::test]
    async fn console_command_runs_directly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let invocation = Invocation {
            command: Some("--help".into()),
            ..Default::default()
        };
        assert_eq!(run(&config, invocation).await.unwrap(), Exit::Success);
        assert!(!config.channel.socket.exists());

        let invocation = Invocation {
            command: Some("--bogus".into()),
            ..Default::default()
        };
        assert_eq!(run(&config, invocation).await.unwrap(), Exit::Failure);
    }

    #[tokio::test]
    async fn service_claim_gives_up_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let held = InstanceLock::try_acquire(&config.instance.lock).unwrap();
        assert!(held.is_first_instance());

        let started = Instant::now();
        let lock = claim_for_service(&config.instance.lock, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!lock.is_first_instance());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn service_claim_succeeds_once_owner_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let held = InstanceLock::try_acquire(&config.instance.lock).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(held);
        });
        let lock = claim_for_service(&config.instance.lock, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lock.is_first_instance());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn unusable_lock_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.instance.lock = dir.path().join("missing").join("wlmd.lock");
        assert!(run(&config, Invocation::default()).await.is_err());
    }

    #[test]
    fn exec_start_carries_service_flag_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let path = dir.path().join("wlmd.toml");
        std::fs::write(&path, "").unwrap();
        let dispatcher = build_dispatcher(&config, Some(&path)).unwrap();
        let exec_start = &dispatcher.settings().exec_start;
        assert!(exec_start.contains(" --service --config "));
        assert!(exec_start.ends_with("wlmd.toml"));
    }
}
