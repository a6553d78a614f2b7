//! Supervisor/worker message protocol.
//!
//! Messages travel as one JSON object per line, tagged by `cmd`:
//!
//! ```text
//! worker -> supervisor   {"cmd":"listening","pid":4242,"port":3001}
//! worker -> supervisor   {"cmd":"restart","pid":4242}
//! supervisor -> worker   {"cmd":"disconnect"}
//! ```
//!
//! The supervisor writes to a worker's stdin and reads its stdout. Closing
//! the worker's stdin is the IPC-level disconnect.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tracing::warn;

use super::types::Pid;
use crate::error::Result;

/// A single IPC message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Message {
    /// Worker asks for permission to restart.
    Restart { pid: Pid },
    /// Worker is bound and serving.
    Listening { pid: Pid, port: u16 },
    /// Supervisor orders the worker to drain and exit.
    Disconnect,
}

impl Message {
    /// Encode as a single newline-terminated line.
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (trailing whitespace is ignored).
    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Write one message and flush.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = message.encode().map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Line reader that yields decoded messages and skips garbage.
pub struct MessageReader<R> {
    lines: Lines<R>,
}

impl<R> MessageReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next well-formed message, or `None` once the stream ends.
    pub async fn next(&mut self) -> std::io::Result<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match Message::decode(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(error = %e, line = %line, "Ignoring malformed IPC line"),
            }
        }
        Ok(None)
    }
}
