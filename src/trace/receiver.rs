//! Incoming side of the helper pipe.
//!
//! Responses arrive on the helper's stdout in whatever order the probes
//! resolve; each complete line is handed to the multiplexer, which matches
//! it to a request by counter.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::trace::engine::Multiplexer;

/// Upper bound on a single response line. Real responses are well under
/// 200 bytes; anything longer is a corrupted stream.
const MAX_LINE_LEN: usize = 4096;

/// Feed helper stdout lines into `mux` until EOF or cancellation
pub async fn run_reader<R, E>(
    reader: R,
    mux: Multiplexer<E>,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    E: Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    // Set while skipping the rest of an oversized line
    let mut discarding = false;

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            read = limited.read_until(b'\n', &mut buf) => read?,
        };
        if read == 0 {
            debug!("Helper closed its stdout");
            break;
        }
        let complete = buf.last() == Some(&b'\n');
        if discarding {
            discarding = !complete;
            continue;
        }
        if buf.len() > MAX_LINE_LEN {
            error!("Dropping oversized response line (more than {} bytes)", MAX_LINE_LEN);
            discarding = !complete;
            continue;
        }
        mux.on_incoming_line(&String::from_utf8_lossy(&buf));
    }
    Ok(())
}

/// Log everything the helper writes to stderr
pub async fn run_stderr_logger<R>(reader: R, cancel: CancellationToken) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => error!("Received error from helper: {}", line),
                    None => {
                        debug!("Helper closed its stderr");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
