//! Status reporting to the host service manager.
//!
//! Under systemd (`Type=notify`) the manager hands us `$NOTIFY_SOCKET`; every
//! lifecycle transition is mirrored there. Outside systemd reporting is a no-op.

use std::ffi::OsString;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::lifecycle::LifecycleState;

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

pub trait StatusReporter: Send + Sync {
    fn report(&self, state: LifecycleState);
}

/// `sd_notify(3)` over a datagram socket.
#[derive(Debug, Clone)]
pub struct SdNotifier {
    addr: Option<OsString>,
}

impl SdNotifier {
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var_os(NOTIFY_SOCKET_ENV).filter(|v| !v.is_empty()),
        }
    }

    pub fn with_socket(addr: impl Into<OsString>) -> Self {
        Self {
            addr: Some(addr.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.addr.is_some()
    }

    fn send(&self, payload: &str) -> io::Result<()> {
        let Some(addr) = &self.addr else {
            return Ok(());
        };
        let sock = UnixDatagram::unbound()?;
        let bytes = addr.as_encoded_bytes();
        if let Some(name) = bytes.strip_prefix(b"@") {
            send_abstract(&sock, name, payload)
        } else {
            sock.send_to(payload.as_bytes(), addr).map(|_| ())
        }
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(sock: &UnixDatagram, name: &[u8], payload: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    sock.send_to_addr(payload.as_bytes(), &addr).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_sock: &UnixDatagram, _name: &[u8], _payload: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract notify sockets need Linux",
    ))
}

pub(crate) fn notify_payload(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::StartPending => "STATUS=Starting",
        LifecycleState::Running => "READY=1\nSTATUS=Running",
        LifecycleState::StopPending => "STOPPING=1\nSTATUS=Stopping",
        LifecycleState::Stopped => "STATUS=Stopped",
    }
}

impl StatusReporter for SdNotifier {
    fn report(&self, state: LifecycleState) {
        if !self.is_enabled() {
            debug!(%state, "Status change (no service manager)");
            return;
        }
        if let Err(err) = self.send(notify_payload(state)) {
            warn!(%state, "Failed to notify service manager: {}", err);
        }
    }
}

/// Keeps every reported state in order, for tests and embedders.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    states: Mutex<Vec<LifecycleState>>,
}

impl RecordingReporter {
    pub fn states(&self) -> Vec<LifecycleState> {
        match self.states.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StatusReporter for RecordingReporter {
    fn report(&self, state: LifecycleState) {
        match self.states.lock() {
            Ok(mut guard) => guard.push(state),
            Err(poisoned) => poisoned.into_inner().push(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_and_stopping_are_announced() {
        assert!(notify_payload(LifecycleState::Running).starts_with("READY=1"));
        assert!(notify_payload(LifecycleState::StopPending).starts_with("STOPPING=1"));
    }

    #[test]
    fn notifier_writes_to_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let notifier = SdNotifier::with_socket(path.as_os_str());
        notifier.report(LifecycleState::Running);

        let mut buf = [0u8; 128];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\nSTATUS=Running");
    }

    #[test]
    fn disabled_notifier_is_silent() {
        let notifier = SdNotifier { addr: None };
        assert!(!notifier.is_enabled());
        notifier.report(LifecycleState::Stopped);
    }

    #[test]
    fn recorder_keeps_order() {
        let recorder = RecordingReporter::default();
        recorder.report(LifecycleState::StartPending);
        recorder.report(LifecycleState::Running);
        assert_eq!(
            recorder.states(),
            vec![LifecycleState::StartPending, LifecycleState::Running]
        );
    }
}
