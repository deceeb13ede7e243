//! Command channel, server half.
//!
//! A single accept loop services one connection at a time: read one command,
//! dispatch it through the registered [`CommandHandler`], write one reply,
//! close. Further clients wait in the listen backlog until the loop comes back
//! around; they are never rejected.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use wlmd_client::wire::{self, Reply, NO_HANDLER_REPLY};

/// Default bound on how long [`ChannelServer::stop`] waits for the loop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on how long a connected peer may take to deliver its command.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What a handler produced for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
}

impl CommandOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Callable invoked by the accept loop for every command it reads.
///
/// It runs on the channel task while the owner may concurrently be handling a
/// shutdown request, so implementations must not rely on exclusive access to
/// anything the owner also touches.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &str) -> CommandOutcome;
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn CommandHandler>>>>;

/// One accepted connection, scoped to a single request/reply exchange.
pub struct ChannelEndpoint {
    stream: UnixStream,
    raw_command: Vec<u8>,
    command_text: String,
    discarded: usize,
}

impl ChannelEndpoint {
    async fn accept(mut stream: UnixStream) -> io::Result<Self> {
        let message = wire::read_message(&mut stream).await?;
        let command_text = message.text();
        Ok(Self {
            stream,
            raw_command: message.bytes,
            command_text,
            discarded: message.discarded,
        })
    }

    pub fn raw_command(&self) -> &[u8] {
        &self.raw_command
    }

    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    async fn respond(mut self, reply: &str) -> io::Result<()> {
        self.stream
            .write_all(wire::clamp_message(reply).as_bytes())
            .await?;
        self.stream.shutdown().await
    }
}

struct RunningServer {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    handler: HandlerSlot,
}

/// Owner of the command channel endpoint.
pub struct ChannelServer {
    endpoint: PathBuf,
    stop_timeout: Duration,
    read_timeout: Duration,
    running: Option<RunningServer>,
}

impl ChannelServer {
    pub fn new<P: AsRef<Path>>(endpoint: P) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            running: None,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Bound on reading one command. A peer that neither finishes nor
    /// half-closes in time is dropped so it cannot hold up later clients.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Change the endpoint name. Refused while the server is running.
    pub fn set_endpoint<P: AsRef<Path>>(&mut self, endpoint: P) -> bool {
        if self.is_running() {
            warn!("Cannot change command channel endpoint while the server is running");
            return false;
        }
        self.endpoint = endpoint.as_ref().to_path_buf();
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the endpoint and launch the accept loop. Returns once the loop is
    /// spawned; a second call while running is a successful no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, handler: Option<Arc<dyn CommandHandler>>) -> io::Result<()> {
        if self.is_running() {
            warn!("Command channel is already running");
            return Ok(());
        }

        // The caller owns the instance lock, so a leftover socket file can
        // only be debris from a dead owner.
        remove_endpoint(&self.endpoint)?;
        let listener = UnixListener::bind(&self.endpoint)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let slot: HandlerSlot = Arc::new(RwLock::new(handler));
        let task = tokio::spawn(accept_loop(
            listener,
            stop_rx,
            Arc::clone(&slot),
            self.read_timeout,
        ));

        self.running = Some(RunningServer {
            stop_tx,
            task,
            handler: slot,
        });
        info!(endpoint = %self.endpoint.display(), "Command channel started");
        Ok(())
    }

    /// Signal the loop, wait up to the stop timeout for it to exit, clear the
    /// handler and release the endpoint name for a later [`start`](Self::start).
    ///
    /// A loop that does not exit in time (a dispatch still running) is
    /// abandoned, not aborted: it finishes that one command and then exits.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("Stopping command channel...");
        let RunningServer {
            stop_tx,
            mut task,
            handler,
        } = running;
        let _ = stop_tx.send(true);

        match timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Command channel task failed: {}", err),
            Err(_) => warn!(
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Command channel did not stop in time; abandoning accept loop"
            ),
        }

        // An abandoned loop may still hold the slot mid-dispatch; it owns that
        // slot alone from here on, so skipping the clear is harmless.
        match handler.try_write() {
            Ok(mut slot) => *slot = None,
            Err(_) => debug!("Handler still in use by abandoned loop; leaving it to finish"),
        }

        if let Err(err) = remove_endpoint(&self.endpoint) {
            warn!(endpoint = %self.endpoint.display(), "Failed to release endpoint: {}", err);
        }
        info!("Command channel stopped");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(true);
            let _ = remove_endpoint(&self.endpoint);
        }
    }
}

fn remove_endpoint(endpoint: &Path) -> io::Result<()> {
    match std::fs::remove_file(endpoint) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

async fn accept_loop(
    listener: UnixListener,
    mut stop_rx: watch::Receiver<bool>,
    handler: HandlerSlot,
    read_timeout: Duration,
) {
    info!("Command channel accept loop started");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => accepted,
        };

        // A connection that raced the stop signal is dropped unserviced.
        if *stop_rx.borrow() {
            break;
        }

        let stream = match accepted {
            Ok((stream, _addr)) => stream,
            Err(err) => {
                error!("Command channel accept failed: {}", err);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        debug!("Client connected to command channel");

        // Reading is cancellable; once a command is in, dispatch runs to the end.
        let read = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
            read = timeout(read_timeout, ChannelEndpoint::accept(stream)) => read,
        };
        let endpoint = match read {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(err)) => {
                warn!("Command channel read failed: {}", err);
                continue;
            }
            Err(_) => {
                warn!(
                    timeout_ms = read_timeout.as_millis() as u64,
                    "Client sent no complete command in time; dropping connection"
                );
                continue;
            }
        };

        if let Err(err) = serve(endpoint, &handler).await {
            warn!("Command channel connection error: {}", err);
        }
    }

    info!("Command channel accept loop stopped");
}

async fn serve(endpoint: ChannelEndpoint, handler: &HandlerSlot) -> io::Result<()> {
    if endpoint.discarded > 0 {
        warn!(
            kept = endpoint.raw_command().len(),
            discarded = endpoint.discarded,
            "Command exceeded channel buffer; truncated"
        );
    }

    let command = endpoint.command_text().to_string();
    info!(%command, "Processing command");

    let reply = {
        // Held across the dispatch so the handler cannot be cleared under it.
        let slot = handler.read().await;
        match slot.as_ref() {
            Some(handler) => {
                let outcome = handler.handle(&command).await;
                Reply::render(&command, outcome.success, &outcome.output)
            }
            None => NO_HANDLER_REPLY.to_string(),
        }
    };

    endpoint.respond(&reply).await?;
    debug!(reply = %reply, "Response sent");
    Ok(())
}
