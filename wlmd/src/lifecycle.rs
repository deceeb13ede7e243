//! Lifecycle coordinator for managed-service mode.
//!
//! The coordinator is the only writer of [`LifecycleState`]. Signal handlers
//! (the host's control path) never touch it; they fire the stop event and the
//! worker loop picks that up on its next wake-up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelServer, CommandHandler};
use crate::notify::StatusReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    StartPending,
    Running,
    StopPending,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, StartPending) | (StartPending, Running) | (Running, StopPending) | (StopPending, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::StartPending => "start-pending",
            LifecycleState::Running => "running",
            LifecycleState::StopPending => "stop-pending",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Cloneable trigger for the coordinator's stop event.
///
/// Requests are latched: one that arrives before the worker loop is running
/// is acted on as soon as it is, and repeats are no-ops.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// A fresh, unfired stop event and the receiver that observes it.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn request_stop(&self) {
        if !self.tx.send_replace(true) {
            debug!("Stop requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct LifecycleCoordinator {
    state: LifecycleState,
    server: ChannelServer,
    handler: Option<Arc<dyn CommandHandler>>,
    reporter: Arc<dyn StatusReporter>,
    poll_interval: Duration,
    stop: StopHandle,
    stop_rx: watch::Receiver<bool>,
}

impl LifecycleCoordinator {
    pub fn new(
        server: ChannelServer,
        handler: Option<Arc<dyn CommandHandler>>,
        reporter: Arc<dyn StatusReporter>,
        poll_interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = StopHandle::new();
        Self {
            state: LifecycleState::Stopped,
            server,
            handler,
            reporter,
            poll_interval,
            stop,
            stop_rx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn transition(&mut self, next: LifecycleState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        info!(from = %self.state, to = %next, "Service state change");
        self.state = next;
        self.reporter.report(next);
        Ok(())
    }

    /// Drive the whole managed-service lifetime: start the channel, run the
    /// worker loop until the stop event fires, tear down, report stopped.
    ///
    /// A channel that fails to start is logged and the service keeps running
    /// without it.
    pub async fn run(mut self) -> Result<ChannelServer, TransitionError> {
        self.transition(LifecycleState::StartPending)?;

        if let Err(err) = self.server.start(self.handler.clone()) {
            error!(
                endpoint = %self.server.endpoint().display(),
                "Failed to start command channel: {}", err
            );
        }
        if *self.stop_rx.borrow() {
            info!("Stop requested during startup; stopping once running");
        }

        self.transition(LifecycleState::Running)?;
        self.worker_loop().await;

        self.transition(LifecycleState::StopPending)?;
        self.server.stop().await;
        self.transition(LifecycleState::Stopped)?;

        Ok(self.server)
    }

    async fn worker_loop(&mut self) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "Service worker running"
        );
        loop {
            let woke = timeout(self.poll_interval, self.stop_rx.wait_for(|stop| *stop))
                .await
                .map(|signaled| signaled.is_ok());
            match woke {
                Ok(true) => break,
                Ok(false) => {
                    warn!("Stop event closed; stopping");
                    break;
                }
                Err(_) => trace!("Worker tick"),
            }
        }
        info!("Service worker observed stop event");
    }
}

/// Route SIGINT and SIGTERM to `stop`.
pub fn spawn_signal_handlers(stop: StopHandle) {
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; stopping");
            ctrl_c_stop.request_stop();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; stopping");
                stop.request_stop();
            }
        });
    }
}
