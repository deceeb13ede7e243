//! Command dispatcher: one keyword, one collaborator call, one outcome.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::channel::{CommandHandler, CommandOutcome};
use crate::config::Config;
use crate::error::{ErrorCode, WlmError, WlmResult};
use crate::process::{self, ProcessControl};
use crate::service::ServiceControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
    Status,
    Suspend,
    Resume,
    WinlogonStatus,
    Help,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Install,
        Command::Uninstall,
        Command::Start,
        Command::Stop,
        Command::Restart,
        Command::Status,
        Command::Suspend,
        Command::Resume,
        Command::WinlogonStatus,
        Command::Help,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Command::Install => "--install",
            Command::Uninstall => "--uninstall",
            Command::Start => "--start",
            Command::Stop => "--stop",
            Command::Restart => "--restart",
            Command::Status => "--status",
            Command::Suspend => "--suspend",
            Command::Resume => "--resume",
            Command::WinlogonStatus => "--winlogon-status",
            Command::Help => "--help",
        }
    }

    fn summary(self) -> &'static str {
        match self {
            Command::Install => "Install service",
            Command::Uninstall => "Uninstall service",
            Command::Start => "Start service",
            Command::Stop => "Stop service",
            Command::Restart => "Restart service",
            Command::Status => "Query service status",
            Command::Suspend => "Suspend target process",
            Command::Resume => "Resume target process",
            Command::WinlogonStatus => "Query target process status",
            Command::Help => "Show this help message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    /// Exact, case-sensitive keyword match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|command| command.keyword() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

pub fn help_text(product: &str, target: &str) -> String {
    let mut text = wlm_build_info::banner(product, env!("CARGO_PKG_VERSION"));
    text.push_str("\nUsage: wlmd [--service] [--config PATH] [--debug] [COMMAND]\n");
    text.push_str("Available commands:\n");
    for command in Command::ALL {
        text.push_str(&format!("  {:<18}{}\n", command.keyword(), command.summary()));
    }
    text.push_str(&format!("Target process: {}\n", target));
    text
}

/// Static inputs the dispatcher needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub display_name: String,
    pub description: String,
    /// `ExecStart=` line written on `--install`.
    pub exec_start: String,
    pub restart_delay: Duration,
    pub target: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config, exec_start: impl Into<String>) -> Self {
        Self {
            display_name: config.service.display_name.clone(),
            description: config.service.description.clone(),
            exec_start: exec_start.into(),
            restart_delay: config.service.restart_delay(),
            target: config.process.target.clone(),
        }
    }
}

pub struct Dispatcher {
    process: Arc<dyn ProcessControl>,
    service: Arc<dyn ServiceControl>,
    settings: DispatchSettings,
    suspended: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        process: Arc<dyn ProcessControl>,
        service: Arc<dyn ServiceControl>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            process,
            service,
            settings,
            suspended: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn help(&self) -> String {
        help_text(&self.settings.display_name, &self.settings.target)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Keywords match exactly. The only tolerance is a single trailing
    /// newline, as left by `echo`-style clients.
    pub async fn dispatch(&self, command: &str) -> CommandOutcome {
        let command = command.strip_suffix('\n').unwrap_or(command);
        info!(%command, "Handling command");

        let parsed = match command.parse::<Command>() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%command, "Unknown command");
                return CommandOutcome::failed(format!("{}\n{}", err, self.help()));
            }
        };

        match parsed {
            Command::Install => self.install().await,
            Command::Uninstall => self.uninstall().await,
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Restart => self.restart().await,
            Command::Status => self.status().await,
            Command::Suspend => self.suspend().await,
            Command::Resume => self.resume().await,
            Command::WinlogonStatus => self.target_status().await,
            Command::Help => CommandOutcome::ok(self.help()),
        }
    }

    async fn install(&self) -> CommandOutcome {
        info!("Installing service...");
        let s = &self.settings;
        match self
            .service
            .install(&s.display_name, &s.description, &s.exec_start)
            .await
        {
            Ok(()) => {
                info!("Service installed successfully");
                CommandOutcome::ok(format!("Service {} installed", self.service.name()))
            }
            Err(err) => {
                error!("Failed to install service: {}", err);
                CommandOutcome::failed(format!("Failed to install service: {}", err))
            }
        }
    }

    async fn uninstall(&self) -> CommandOutcome {
        info!("Uninstalling service...");
        match self.service.uninstall().await {
            Ok(()) => CommandOutcome::ok(format!("Service {} uninstalled", self.service.name())),
            Err(err) => {
                error!("Failed to uninstall service: {}", err);
                CommandOutcome::failed(format!("Failed to uninstall service: {}", err))
            }
        }
    }

    async fn start(&self) -> CommandOutcome {
        match self.service.start().await {
            Ok(()) => CommandOutcome::ok(format!("Service {} started", self.service.name())),
            Err(err) => {
                error!("Failed to start service: {}", err);
                CommandOutcome::failed(format!("Failed to start service: {}", err))
            }
        }
    }

    async fn stop(&self) -> CommandOutcome {
        match self.service.stop().await {
            Ok(()) => CommandOutcome::ok(format!("Service {} stopped", self.service.name())),
            Err(err) => {
                error!("Failed to stop service: {}", err);
                CommandOutcome::failed(format!("Failed to stop service: {}", err))
            }
        }
    }

    async fn restart(&self) -> CommandOutcome {
        info!("Restarting service...");
        if let Err(err) = self.service.stop().await {
            error!("Failed to restart service: {}", err);
            return CommandOutcome::failed(format!("Failed to restart service: {}", err));
        }
        tokio::time::sleep(self.settings.restart_delay).await;
        match self.service.start().await {
            Ok(()) => CommandOutcome::ok(format!("Service {} restarted", self.service.name())),
            Err(err) => {
                error!("Failed to restart service: {}", err);
                CommandOutcome::failed(format!("Failed to restart service: {}", err))
            }
        }
    }

    async fn status(&self) -> CommandOutcome {
        match self.service.query_state().await {
            Ok(state) => {
                info!(%state, "Service status");
                CommandOutcome::ok(format!("Service status: {}", state))
            }
            Err(err) => {
                error!("Failed to query service status: {}", err);
                CommandOutcome::failed(err.to_string())
            }
        }
    }

    async fn suspend(&self) -> CommandOutcome {
        let target = &self.settings.target;
        info!(%target, "Suspending process...");
        let control = Arc::clone(&self.process);
        let name = target.clone();
        match off_runtime(move || process::suspend_by_name(control.as_ref(), &name)).await {
            Ok(pids) => {
                self.suspended.store(true, Ordering::SeqCst);
                CommandOutcome::ok(format!("Suspended {} (pids {:?})", target, pids))
            }
            Err(err) => {
                error!(%target, "Failed to suspend process: {}", err);
                CommandOutcome::failed(format!("Failed to suspend {}: {}", target, err))
            }
        }
    }

    async fn resume(&self) -> CommandOutcome {
        let target = &self.settings.target;
        info!(%target, "Resuming process...");
        let control = Arc::clone(&self.process);
        let name = target.clone();
        match off_runtime(move || process::resume_by_name(control.as_ref(), &name)).await {
            Ok(pids) => {
                self.suspended.store(false, Ordering::SeqCst);
                CommandOutcome::ok(format!("Resumed {} (pids {:?})", target, pids))
            }
            Err(err) => {
                error!(%target, "Failed to resume process: {}", err);
                CommandOutcome::failed(format!("Failed to resume {}: {}", target, err))
            }
        }
    }

    async fn target_status(&self) -> CommandOutcome {
        let target = &self.settings.target;
        let control = Arc::clone(&self.process);
        let name = target.clone();
        let running = off_runtime(move || Ok(control.is_process_running(&name)))
            .await
            .unwrap_or(false);
        let text = if !running {
            warn!(%target, "Process is not running");
            format!("{} process is not running", target)
        } else if self.is_suspended() {
            format!("{} process is running (suspended)", target)
        } else {
            format!("{} process is running (active)", target)
        };
        info!("{}", text);
        CommandOutcome::ok(text)
    }
}

/// Run a `/proc` scan or signal delivery on the blocking pool.
async fn off_runtime<T, F>(op: F) -> WlmResult<T>
where
    F: FnOnce() -> WlmResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(|err| {
        WlmError::new(ErrorCode::UnknownError, format!("process task failed: {}", err))
    })?
}

#[async_trait]
impl CommandHandler for Dispatcher {
    async fn handle(&self, command: &str) -> CommandOutcome {
        self.dispatch(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelServer;
    use crate::error::{ErrorCode, WlmError, WlmResult};
    use crate::service::ServiceState;
    use std::sync::Mutex;
    use wlmd_client::{ChannelClient, Reply};

    #[derive(Default)]
    struct FakeProcesses {
        pids: Vec<u32>,
        suspended: Mutex<Vec<u32>>,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ProcessControl for FakeProcesses {
        fn find_processes_by_name(&self, name: &str) -> WlmResult<Vec<u32>> {
            Ok(if name == "winlogon" { self.pids.clone() } else { Vec::new() })
        }

        fn suspend_process(&self, pid: u32) -> WlmResult<()> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            self.suspended.lock().unwrap().push(pid);
            Ok(())
        }

        fn resume_process(&self, pid: u32) -> WlmResult<()> {
            self.suspended.lock().unwrap().retain(|p| *p != pid);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeService {
        installed: bool,
        stop_fails: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeService {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) -> WlmResult<()> {
            self.calls.lock().unwrap().push(call);
            if self.installed {
                Ok(())
            } else {
                Err(WlmError::new(ErrorCode::ServiceNotFound, "wlmd"))
            }
        }
    }

    #[async_trait]
    impl ServiceControl for FakeService {
        fn name(&self) -> &str {
            "wlmd"
        }
        async fn is_installed(&self) -> bool {
            self.installed
        }
        async fn install(&self, _: &str, _: &str, exec_start: &str) -> WlmResult<()> {
            assert!(exec_start.ends_with("--service"));
            self.calls.lock().unwrap().push("install");
            Ok(())
        }
        async fn uninstall(&self) -> WlmResult<()> {
            self.calls.lock().unwrap().push("uninstall");
            Ok(())
        }
        async fn start(&self) -> WlmResult<()> {
            self.record("start")
        }
        async fn stop(&self) -> WlmResult<()> {
            self.record("stop")?;
            if self.stop_fails {
                return Err(WlmError::new(ErrorCode::AccessDenied, "stop"));
            }
            Ok(())
        }
        async fn query_state(&self) -> WlmResult<ServiceState> {
            self.record("query")?;
            Ok(ServiceState::Running)
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            display_name: "Winlogon Manager Service".into(),
            description: "test".into(),
            exec_start: "/usr/bin/wlmd --service".into(),
            restart_delay: Duration::from_millis(1),
            target: "winlogon".into(),
        }
    }

    fn dispatcher(process: FakeProcesses, service: FakeService) -> (Dispatcher, Arc<FakeProcesses>, Arc<FakeService>) {
        let process = Arc::new(process);
        let service = Arc::new(service);
        (
            Dispatcher::new(process.clone(), service.clone(), settings()),
            process,
            service,
        )
    }

    #[test]
    fn keywords_are_exact_and_case_sensitive() {
        assert_eq!("--winlogon-status".parse::<Command>().unwrap(), Command::WinlogonStatus);
        for command in Command::ALL {
            assert_eq!(command.keyword().parse::<Command>().unwrap(), command);
        }
        assert!("--STATUS".parse::<Command>().is_err());
        assert!("status".parse::<Command>().is_err());
    }

    #[test]
    fn help_lists_every_keyword() {
        let help = help_text("Winlogon Manager Service", "winlogon");
        assert!(help.starts_with("Winlogon Manager Service v"));
        for command in Command::ALL {
            assert!(help.contains(command.keyword()));
        }
    }

    #[tokio::test]
    async fn status_of_missing_service_fails_with_not_found() {
        let (dispatcher, _, _) = dispatcher(FakeProcesses::default(), FakeService::default());
        let outcome = dispatcher.dispatch("--status").await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("not"));
        assert_eq!(outcome.output, "Service not found: wlmd");
    }

    #[tokio::test]
    async fn status_of_installed_service_reports_state() {
        let service = FakeService {
            installed: true,
            ..Default::default()
        };
        let (dispatcher, _, _) = dispatcher(FakeProcesses::default(), service);
        let outcome = dispatcher.dispatch("--status\n").await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "Service status: Running");
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_not_a_keyword() {
        let service = FakeService {
            installed: true,
            ..Default::default()
        };
        let (dispatcher, _, service) = dispatcher(FakeProcesses::default(), service);
        for command in ["  --status", "--status ", "--status\n\n", "\t--status\n"] {
            let outcome = dispatcher.dispatch(command).await;
            assert!(!outcome.success, "{:?} was accepted", command);
            assert!(outcome.output.starts_with("Unknown command: "));
            assert!(outcome.output.contains("Available commands"));
        }
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_fails_with_help() {
        let (dispatcher, _, _) = dispatcher(FakeProcesses::default(), FakeService::default());
        let outcome = dispatcher.dispatch("--reboot").await;
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("Unknown command: --reboot"));
        assert!(outcome.output.contains("--winlogon-status"));
    }

    #[tokio::test]
    async fn suspend_and_resume_track_state() {
        let processes = FakeProcesses {
            pids: vec![42, 43],
            ..Default::default()
        };
        let (dispatcher, process, _) = dispatcher(processes, FakeService::default());

        let outcome = dispatcher.dispatch("--winlogon-status").await;
        assert_eq!(outcome.output, "winlogon process is running (active)");

        assert!(dispatcher.dispatch("--suspend").await.success);
        assert_eq!(*process.suspended.lock().unwrap(), vec![42, 43]);
        let outcome = dispatcher.dispatch("--winlogon-status").await;
        assert_eq!(outcome.output, "winlogon process is running (suspended)");

        assert!(dispatcher.dispatch("--resume").await.success);
        assert!(!dispatcher.is_suspended());
        assert!(process.suspended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_calls_leave_the_runtime_thread() {
        let processes = FakeProcesses {
            pids: vec![5],
            ..Default::default()
        };
        let (dispatcher, process, _) = dispatcher(processes, FakeService::default());
        assert!(dispatcher.dispatch("--suspend").await.success);

        let threads = process.threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn suspend_without_target_fails_but_status_succeeds() {
        let (dispatcher, _, _) = dispatcher(FakeProcesses::default(), FakeService::default());
        let outcome = dispatcher.dispatch("--suspend").await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("Process not found"));
        assert!(!dispatcher.is_suspended());

        let outcome = dispatcher.dispatch("--winlogon-status").await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "winlogon process is not running");
    }

    #[tokio::test]
    async fn restart_skips_start_when_stop_fails() {
        let service = FakeService {
            installed: true,
            stop_fails: true,
            ..Default::default()
        };
        let (dispatcher, _, service) = dispatcher(FakeProcesses::default(), service);
        let outcome = dispatcher.dispatch("--restart").await;
        assert!(!outcome.success);
        assert_eq!(service.calls(), vec!["stop"]);
    }

    #[tokio::test]
    async fn restart_is_stop_then_start() {
        let service = FakeService {
            installed: true,
            ..Default::default()
        };
        let (dispatcher, _, service) = dispatcher(FakeProcesses::default(), service);
        assert!(dispatcher.dispatch("--restart").await.success);
        assert_eq!(service.calls(), vec!["stop", "start"]);
    }

    #[tokio::test]
    async fn install_passes_service_exec_line() {
        let (dispatcher, _, service) = dispatcher(FakeProcesses::default(), FakeService::default());
        assert!(dispatcher.dispatch("--install").await.success);
        assert!(dispatcher.dispatch("--uninstall").await.success);
        assert_eq!(service.calls(), vec!["install", "uninstall"]);
    }

    #[tokio::test]
    async fn suspend_forwarded_over_channel() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("wlmd.sock");
        let processes = FakeProcesses {
            pids: vec![7],
            ..Default::default()
        };
        let (dispatcher, process, _) = dispatcher(processes, FakeService::default());

        let mut server = ChannelServer::new(&endpoint);
        server.start(Some(Arc::new(dispatcher))).unwrap();

        let reply = ChannelClient::new(&endpoint).send("--suspend").await.unwrap();
        assert!(reply.is_success(), "{:?}", reply);
        assert!(matches!(reply, Reply::Succeeded { ref detail } if detail.starts_with("--suspend")));
        assert_eq!(*process.suspended.lock().unwrap(), vec![7]);

        server.stop().await;
    }
}
