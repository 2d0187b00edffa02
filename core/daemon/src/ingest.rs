//! Status ingestion endpoint.
//!
//! Hook scripts connect, write newline-terminated status lines, and close.
//! Clients may send several lines per connection and may split a line across
//! writes; only complete lines are acted on. A bad line is logged and skipped
//! without dropping the connection.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use workspace_status_protocol::{parse_status_line, MAX_LINE_BYTES};

use crate::socket::{BoundSocket, EndpointError};
use crate::tracker::{EventOutcome, StatusTracker};

const READ_CHUNK_SIZE: usize = 4096;

pub struct StatusListener {
    socket: BoundSocket,
}

impl StatusListener {
    pub fn bind(path: PathBuf) -> Result<Self, EndpointError> {
        let socket = BoundSocket::bind(path)?;
        info!(path = %socket.path().display(), "Status socket listening");
        Ok(Self { socket })
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self, tracker: Arc<StatusTracker>) {
        loop {
            match self.socket.listener().accept().await {
                Ok((stream, _addr)) => {
                    let tracker = Arc::clone(&tracker);
                    tokio::spawn(async move {
                        match handle_connection(stream, &tracker).await {
                            Ok(stats) => debug!(
                                lines = stats.lines,
                                malformed = stats.malformed,
                                "Status connection closed"
                            ),
                            Err(err) => {
                                warn!(error = %err, "Status connection closed with error");
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %self.socket.path().display(),
                        "Failed to accept status connection"
                    );
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub lines: usize,
    pub malformed: usize,
}

/// Reads status lines until EOF, handing each to the tracker in order.
pub async fn handle_connection<R>(
    mut reader: R,
    tracker: &StatusTracker,
) -> std::io::Result<ConnectionStats>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new(MAX_LINE_BYTES);
    let mut stats = ConnectionStats::default();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.push(&chunk[..n]);
        while let Some(frame) = buffer.next_frame() {
            dispatch_frame(frame, tracker, &mut stats);
        }
    }

    let trailing = buffer.finish();
    if trailing > 0 {
        warn!(bytes = trailing, "Discarding unterminated data at connection close");
    }
    Ok(stats)
}

fn dispatch_frame(frame: Frame, tracker: &StatusTracker, stats: &mut ConnectionStats) {
    let line = match frame {
        Frame::Line(line) => line,
        Frame::Oversized { discarded } => {
            warn!(bytes = discarded, limit = MAX_LINE_BYTES, "Status line too long; dropping");
            stats.malformed += 1;
            return;
        }
    };

    if line.trim().is_empty() {
        return;
    }

    match parse_status_line(&line) {
        Ok(parsed) => {
            stats.lines += 1;
            let outcome = tracker.process_event(&parsed.workspace, &parsed.verb, &parsed.args);
            if outcome == EventOutcome::StoreFailed {
                debug!(workspace = %parsed.workspace, "Event dropped after store failure");
            }
        }
        Err(err) => {
            stats.malformed += 1;
            warn!(error = %err, line = %line.trim(), "Malformed status line");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Oversized { discarded: usize },
}

/// Accumulates raw bytes and yields newline-terminated frames.
///
/// A line longer than the limit is dropped whole: its bytes are discarded as
/// they arrive and framing resumes after its terminating newline.
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
    discarding: bool,
    discarded: usize,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
            discarded: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        let Some(index) = self.pending.iter().position(|b| *b == b'\n') else {
            if self.discarding || self.pending.len() > self.max_line {
                self.discarding = true;
                self.discarded += self.pending.len();
                self.pending.clear();
            }
            return None;
        };

        let line: Vec<u8> = self.pending.drain(..=index).collect();
        if self.discarding {
            let discarded = self.discarded + line.len();
            self.discarding = false;
            self.discarded = 0;
            return Some(Frame::Oversized { discarded });
        }
        if index > self.max_line {
            return Some(Frame::Oversized {
                discarded: line.len(),
            });
        }

        Some(Frame::Line(
            String::from_utf8_lossy(&line[..index]).into_owned(),
        ))
    }

    /// Bytes left without a terminating newline.
    pub fn finish(self) -> usize {
        self.pending.len() + self.discarded
    }
}
