//! Outgoing side of the helper pipe.
//!
//! The multiplexer never touches the child's stdin directly: it hands each
//! encoded line to a `LineSink`, which must not block. The default sink
//! queues lines on an unbounded channel drained by `run_writer`.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MuxError;

/// Non-blocking write side of the helper connection
pub trait LineSink: Send + Sync {
    /// Queue one newline-terminated line for the helper
    fn send_line(&self, line: String) -> Result<(), MuxError>;
}

/// `LineSink` backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Create a sink and the receiver that `run_writer` drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LineSink for ChannelSink {
    fn send_line(&self, line: String) -> Result<(), MuxError> {
        self.tx
            .send(line)
            .map_err(|_| MuxError::Transport("helper input is closed".to_string()))
    }
}

/// Copy queued lines into the helper's stdin until cancelled, the queue
/// closes, or a write fails
pub async fn run_writer<W>(
    mut lines: mpsc::UnboundedReceiver<String>,
    mut writer: W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
    // Dropping the receiver makes further sends fail fast
    lines.close();
    writer.shutdown().await.ok();
    Ok(())
}
