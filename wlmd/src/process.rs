//! Process controller: find processes by name and freeze / thaw them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WlmError, WlmResult};

/// Kernel limit on `/proc/<pid>/comm` (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

/// Operations the dispatcher needs from the platform. Every call is
/// synchronous and single-shot.
pub trait ProcessControl: Send + Sync {
    fn find_processes_by_name(&self, name: &str) -> WlmResult<Vec<u32>>;
    fn suspend_process(&self, pid: u32) -> WlmResult<()>;
    fn resume_process(&self, pid: u32) -> WlmResult<()>;

    fn is_process_running(&self, name: &str) -> bool {
        self.find_processes_by_name(name)
            .map(|pids| !pids.is_empty())
            .unwrap_or(false)
    }
}

/// `/proc` + signal based controller.
#[derive(Debug, Clone)]
pub struct ProcessController {
    proc_root: PathBuf,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcessController {
    pub fn new<P: AsRef<Path>>(proc_root: P) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }

    fn read_comm(&self, pid: u32) -> io::Result<String> {
        let raw = fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))?;
        Ok(raw.trim_end_matches('\n').to_string())
    }

    fn signal(&self, pid: u32, signal: Signal) -> WlmResult<()> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| WlmError::new(ErrorCode::InvalidParameter, format!("pid {}", pid)))?;
        kill(Pid::from_raw(raw), signal).map_err(|errno| {
            WlmError::new(
                ErrorCode::from_errno(errno),
                format!("{} to pid {}: {}", signal, pid, errno),
            )
        })
    }
}

/// Case-insensitive comparison against the kernel's truncated command name.
fn comm_matches(comm: &str, wanted: &str) -> bool {
    let wanted: String = wanted.chars().take(COMM_LEN).collect();
    comm.eq_ignore_ascii_case(&wanted)
}

impl ProcessControl for ProcessController {
    fn find_processes_by_name(&self, name: &str) -> WlmResult<Vec<u32>> {
        let entries = fs::read_dir(&self.proc_root).map_err(|err| {
            WlmError::io(&err, ErrorCode::UnknownError, self.proc_root.display())
        })?;

        let own_pid = std::process::id();
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| *pid != own_pid)
            // Processes can exit mid-scan; an unreadable entry is just skipped.
            .filter(|pid| {
                self.read_comm(*pid)
                    .map(|comm| comm_matches(&comm, name))
                    .unwrap_or(false)
            })
            .collect();
        pids.sort_unstable();
        debug!(%name, ?pids, "Process lookup");
        Ok(pids)
    }

    fn suspend_process(&self, pid: u32) -> WlmResult<()> {
        self.signal(pid, Signal::SIGSTOP)
    }

    fn resume_process(&self, pid: u32) -> WlmResult<()> {
        self.signal(pid, Signal::SIGCONT)
    }
}

/// Suspend every process called `name`. Succeeds if at least one was
/// suspended and returns the pids acted on.
pub fn suspend_by_name(control: &dyn ProcessControl, name: &str) -> WlmResult<Vec<u32>> {
    apply_by_name(control, name, "suspend", |pid| control.suspend_process(pid))
}

/// Resume every process called `name`; same success rule as [`suspend_by_name`].
pub fn resume_by_name(control: &dyn ProcessControl, name: &str) -> WlmResult<Vec<u32>> {
    apply_by_name(control, name, "resume", |pid| control.resume_process(pid))
}

fn apply_by_name<F>(control: &dyn ProcessControl, name: &str, verb: &str, op: F) -> WlmResult<Vec<u32>>
where
    F: Fn(u32) -> WlmResult<()>,
{
    let pids = control.find_processes_by_name(name)?;
    if pids.is_empty() {
        return Err(WlmError::new(
            ErrorCode::ProcessNotFound,
            format!("no process named {}", name),
        ));
    }

    let mut done = Vec::new();
    let mut last_err = None;
    for pid in pids {
        match op(pid) {
            Ok(()) => {
                info!(%name, pid, "Process {}d", verb);
                done.push(pid);
            }
            Err(err) => {
                warn!(%name, pid, "Failed to {} process: {}", verb, err);
                last_err = Some(err);
            }
        }
    }

    match (done.is_empty(), last_err) {
        (false, _) => Ok(done),
        (true, Some(err)) => Err(err),
        (true, None) => Err(WlmError::new(
            ErrorCode::ProcessNotFound,
            format!("no process named {}", name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn fake_proc(entries: &[(u32, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm) in entries {
            let pid_dir = dir.path().join(pid.to_string());
            fs::create_dir_all(&pid_dir).unwrap();
            fs::write(pid_dir.join("comm"), format!("{}\n", comm)).unwrap();
        }
        fs::create_dir_all(dir.path().join("self")).unwrap();
        dir
    }

    #[test]
    fn finds_matching_pids_case_insensitively() {
        let root = fake_proc(&[(10, "winlogon"), (11, "bash"), (12, "WinLogon")]);
        let control = ProcessController::new(root.path());
        assert_eq!(control.find_processes_by_name("winlogon").unwrap(), vec![10, 12]);
        assert!(control.is_process_running("bash"));
        assert!(!control.is_process_running("sshd"));
    }

    #[test]
    fn long_names_match_truncated_comm() {
        let root = fake_proc(&[(20, "a-very-long-nam")]);
        let control = ProcessController::new(root.path());
        assert_eq!(
            control.find_processes_by_name("a-very-long-name-daemon").unwrap(),
            vec![20]
        );
    }

    #[test]
    fn by_name_without_match_is_process_not_found() {
        let root = fake_proc(&[(30, "bash")]);
        let control = ProcessController::new(root.path());
        let err = suspend_by_name(&control, "winlogon").unwrap_err();
        assert_eq!(err.code, ErrorCode::ProcessNotFound);
    }

    #[test]
    fn invalid_pid_is_rejected() {
        let control = ProcessController::default();
        let err = control.suspend_process(0).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn stops_and_continues_a_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let control = ProcessController::default();

        control.suspend_process(child.id()).unwrap();
        let state = |pid: u32| {
            let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap();
            let after_name = &stat[stat.rfind(')').unwrap() + 2..];
            after_name.chars().next().unwrap()
        };
        let mut observed = state(child.id());
        for _ in 0..50 {
            if observed == 'T' {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            observed = state(child.id());
        }
        assert_eq!(observed, 'T');

        control.resume_process(child.id()).unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}
