//! wlmd client library
//!
//! Client half of the wlmd command channel: connect to the running instance,
//! send one command, read one reply. Also home of the shared wire contract
//! (see [`wire`]) so the server half cannot drift from it.

pub mod wire;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub use wire::{Reply, MAX_MESSAGE_LEN, MESSAGE_BUFFER_SIZE, NO_HANDLER_REPLY};

pub const DEFAULT_SOCK: &str = "/tmp/wlmd.sock";

/// Upper bound on how long a forwarded command may take to answer.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Nobody is listening on the endpoint. Callers use this to conclude that
    /// no other instance is running.
    #[error("no instance listening on {path}: {source}")]
    Unavailable { path: String, source: io::Error },
    #[error("failed to send command: {0}")]
    Write(io::Error),
    #[error("failed to read reply: {0}")]
    Read(io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Client for a single endpoint. Holds no connection; each call opens its own.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    sock_path: PathBuf,
    reply_timeout: Duration,
}

impl ChannelClient {
    pub fn new<P: AsRef<Path>>(sock: P) -> Self {
        Self {
            sock_path: sock.as_ref().to_path_buf(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn endpoint(&self) -> &Path {
        &self.sock_path
    }

    /// Send `command` and return the raw reply text.
    ///
    /// The command goes out whole; the server keeps at most
    /// [`MAX_MESSAGE_LEN`] bytes of it.
    ///
    /// Fails fast when no server is listening; there is no retry and no
    /// wait-for-server. On any error no partial reply is returned and the
    /// caller must not assume the command had any effect.
    pub async fn send_command(&self, command: &str) -> Result<String, ClientError> {
        let mut stream =
            UnixStream::connect(&self.sock_path)
                .await
                .map_err(|source| ClientError::Unavailable {
                    path: self.sock_path.display().to_string(),
                    source,
                })?;

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(ClientError::Write)?;
        // Half-close marks the end of the request message.
        stream.shutdown().await.map_err(ClientError::Write)?;

        let message = match timeout(self.reply_timeout, wire::read_message(&mut stream)).await {
            Err(_) => return Err(ClientError::Timeout(self.reply_timeout)),
            Ok(Err(err)) => return Err(ClientError::Read(err)),
            Ok(Ok(message)) => message,
        };

        if message.is_truncated() {
            warn!(
                discarded = message.discarded,
                "Reply exceeded {} bytes and was truncated", MAX_MESSAGE_LEN
            );
        }

        let reply = message.text();
        debug!(%command, reply = %reply, "Command sent");
        Ok(reply)
    }

    /// Send `command` and classify the reply.
    pub async fn send(&self, command: &str) -> Result<Reply, ClientError> {
        self.send_command(command).await.map(|text| Reply::parse(&text))
    }
}
