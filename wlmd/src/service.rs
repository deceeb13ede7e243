//! Service lifecycle manager backed by systemd.
//!
//! The daemon's own lifecycle state (see `lifecycle`) is separate from what
//! systemd reports here; the install/start/stop commands are what keep the
//! two in step.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WlmError, WlmResult};

/// Host-reported state of the managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Stopping => "Stopping",
        })
    }
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    fn name(&self) -> &str;
    async fn is_installed(&self) -> bool;
    async fn install(&self, display_name: &str, description: &str, exec_start: &str) -> WlmResult<()>;
    async fn uninstall(&self) -> WlmResult<()>;
    async fn start(&self) -> WlmResult<()>;
    async fn stop(&self) -> WlmResult<()>;
    async fn query_state(&self) -> WlmResult<ServiceState>;
}

const UNINSTALL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    name: String,
    unit_dir: PathBuf,
    systemctl: PathBuf,
}

/// Output of `systemctl show -p LoadState -p ActiveState`.
#[derive(Debug, Default, PartialEq, Eq)]
struct UnitProperties {
    load_state: String,
    active_state: String,
}

impl UnitProperties {
    fn parse(output: &str) -> Self {
        let mut props = UnitProperties::default();
        for line in output.lines() {
            match line.split_once('=') {
                Some(("LoadState", value)) => props.load_state = value.trim().to_string(),
                Some(("ActiveState", value)) => props.active_state = value.trim().to_string(),
                _ => {}
            }
        }
        props
    }

    fn is_loaded(&self) -> bool {
        !self.load_state.is_empty() && self.load_state != "not-found"
    }

    fn state(&self) -> ServiceState {
        match self.active_state.as_str() {
            "active" => ServiceState::Running,
            "activating" | "reloading" => ServiceState::Starting,
            "deactivating" => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

impl SystemdServiceManager {
    pub fn new(name: impl Into<String>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            unit_dir: unit_dir.into(),
            systemctl: PathBuf::from("systemctl"),
        }
    }

    /// Use a different `systemctl` binary (wrappers, `--user` shims, tests).
    pub fn with_systemctl(mut self, systemctl: impl Into<PathBuf>) -> Self {
        self.systemctl = systemctl.into();
        self
    }

    fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    async fn systemctl(&self, args: &[&str]) -> WlmResult<String> {
        debug!(systemctl = %self.systemctl.display(), ?args, "Running systemctl");
        let output = TokioCommand::new(&self.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|err| {
                WlmError::io(
                    &err,
                    ErrorCode::ServiceNotFound,
                    format!("cannot run {}", self.systemctl.display()),
                )
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = classify_systemctl_failure(&stderr);
        Err(WlmError::new(
            code,
            format!(
                "systemctl {} failed ({}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr
            ),
        ))
    }

    async fn properties(&self) -> WlmResult<UnitProperties> {
        let unit = self.unit_name();
        let output = self
            .systemctl(&["show", "-p", "LoadState", "-p", "ActiveState", &unit])
            .await?;
        Ok(UnitProperties::parse(&output))
    }

    async fn require_installed(&self) -> WlmResult<()> {
        if self.is_installed().await {
            Ok(())
        } else {
            Err(WlmError::new(ErrorCode::ServiceNotFound, self.name.clone()))
        }
    }

    fn render_unit(display_name: &str, description: &str, exec_start: &str) -> String {
        format!(
            "# {description}\n\
             [Unit]\n\
             Description={display_name}\n\
             After=local-fs.target\n\
             \n\
             [Service]\n\
             Type=notify\n\
             NotifyAccess=main\n\
             ExecStart={exec_start}\n\
             KillMode=process\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }

    async fn write_unit(&self, contents: &str) -> WlmResult<()> {
        let unit_path = self.unit_path();
        let temp_path = self.unit_dir.join(format!(".{}.tmp", self.unit_name()));
        let context = |err: &io::Error| {
            WlmError::io(err, ErrorCode::InvalidParameter, unit_path.display())
        };

        tokio::fs::write(&temp_path, contents)
            .await
            .map_err(|err| context(&err))?;
        if let Err(err) = tokio::fs::rename(&temp_path, &unit_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(context(&err));
        }
        Ok(())
    }
}

fn classify_systemctl_failure(stderr: &str) -> ErrorCode {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("access denied")
        || lower.contains("permission denied")
        || lower.contains("authentication required")
    {
        ErrorCode::AccessDenied
    } else if lower.contains("not loaded")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        ErrorCode::ServiceNotFound
    } else if lower.contains("invalid") {
        ErrorCode::InvalidParameter
    } else {
        ErrorCode::UnknownError
    }
}

#[async_trait]
impl ServiceControl for SystemdServiceManager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_installed(&self) -> bool {
        if self.unit_path().is_file() {
            return true;
        }
        match self.properties().await {
            Ok(props) => props.is_loaded(),
            Err(err) => {
                debug!("Unit lookup failed: {}", err);
                false
            }
        }
    }

    async fn install(&self, display_name: &str, description: &str, exec_start: &str) -> WlmResult<()> {
        if self.is_installed().await {
            info!(service = %self.name, "Service already exists");
            return Ok(());
        }

        let unit = Self::render_unit(display_name, description, exec_start);
        self.write_unit(&unit).await?;
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", &self.unit_name()]).await?;

        info!(service = %self.name, unit = %self.unit_path().display(), "Service installed");
        Ok(())
    }

    async fn uninstall(&self) -> WlmResult<()> {
        if !self.is_installed().await {
            info!(service = %self.name, "Service not found; nothing to uninstall");
            return Ok(());
        }

        let unit = self.unit_name();
        if self.systemctl(&["stop", "--no-block", &unit]).await.is_ok() {
            info!(service = %self.name, "Stopping service...");
            tokio::time::sleep(UNINSTALL_SETTLE).await;
        }
        if let Err(err) = self.systemctl(&["disable", &unit]).await {
            warn!(service = %self.name, "Disable failed: {}", err);
        }

        match tokio::fs::remove_file(self.unit_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(WlmError::io(
                    &err,
                    ErrorCode::ServiceNotFound,
                    self.unit_path().display(),
                ))
            }
        }
        self.systemctl(&["daemon-reload"]).await?;

        info!(service = %self.name, "Service uninstalled");
        Ok(())
    }

    async fn start(&self) -> WlmResult<()> {
        self.require_installed().await?;
        self.systemctl(&["start", "--no-block", &self.unit_name()])
            .await?;
        info!(service = %self.name, "Service start requested");
        Ok(())
    }

    async fn stop(&self) -> WlmResult<()> {
        self.require_installed().await?;
        self.systemctl(&["stop", "--no-block", &self.unit_name()])
            .await?;
        info!(service = %self.name, "Service stop requested");
        Ok(())
    }

    async fn query_state(&self) -> WlmResult<ServiceState> {
        self.require_installed().await?;
        let props = self.properties().await?;
        Ok(props.state())
    }
}
