//! Wire contract of the command channel.
//!
//! One connection carries exactly one request and one reply. A message is the
//! raw text written by the sender up to its half-close, capped at
//! [`MAX_MESSAGE_LEN`] bytes; anything past the cap is read and discarded.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the per-direction channel buffer.
pub const MESSAGE_BUFFER_SIZE: usize = 4096;

/// Longest message either side will keep (one byte of the buffer is reserved).
pub const MAX_MESSAGE_LEN: usize = MESSAGE_BUFFER_SIZE - 1;

pub const SUCCESS_PHRASE: &str = "Command executed successfully: ";
pub const FAILURE_PHRASE: &str = "Command execution failed: ";
pub const NO_HANDLER_REPLY: &str = "No command handler available";

/// A message read off the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub bytes: Vec<u8>,
    /// Number of bytes past the cap that were dropped.
    pub discarded: usize,
}

impl Message {
    pub fn is_truncated(&self) -> bool {
        self.discarded > 0
    }

    /// Lossy text view; a truncation point that splits a UTF-8 sequence
    /// decodes to a replacement character rather than failing.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read one message: everything up to EOF, keeping at most `MAX_MESSAGE_LEN` bytes.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::with_capacity(MESSAGE_BUFFER_SIZE);
    (&mut *reader)
        .take(MAX_MESSAGE_LEN as u64)
        .read_to_end(&mut bytes)
        .await?;

    // Drain the overflow so the peer never sees a reset on close.
    let mut discarded = 0usize;
    if bytes.len() == MAX_MESSAGE_LEN {
        let mut scratch = [0u8; MESSAGE_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            discarded += n;
        }
    }

    Ok(Message { bytes, discarded })
}

/// Cut `text` to at most `MAX_MESSAGE_LEN` bytes on a char boundary.
pub fn clamp_message(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Server reply, classified by its leading phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Succeeded { detail: String },
    Failed { detail: String },
    NoHandler,
    Unrecognized(String),
}

impl Reply {
    pub fn parse(text: &str) -> Self {
        if let Some(rest) = text.strip_prefix(SUCCESS_PHRASE) {
            Reply::Succeeded {
                detail: rest.to_string(),
            }
        } else if let Some(rest) = text.strip_prefix(FAILURE_PHRASE) {
            Reply::Failed {
                detail: rest.to_string(),
            }
        } else if text.starts_with(NO_HANDLER_REPLY) {
            Reply::NoHandler
        } else {
            Reply::Unrecognized(text.to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Succeeded { .. })
    }

    /// Render a handler result as reply text: phrase, echoed command, then the
    /// handler's own output on the following lines.
    pub fn render(command: &str, success: bool, output: &str) -> String {
        let phrase = if success { SUCCESS_PHRASE } else { FAILURE_PHRASE };
        let mut text = format!("{}{}", phrase, command);
        if !output.trim().is_empty() {
            text.push('\n');
            text.push_str(output.trim_end());
        }
        clamp_message(&text).to_string()
    }
}
