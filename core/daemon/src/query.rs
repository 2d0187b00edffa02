//! Query endpoint.
//!
//! One JSON request per connection, newline-terminated, answered with one
//! JSON response. `subscribe` keeps the connection open after its response
//! and streams every status change as a JSON line until the client leaves.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use workspace_status_protocol::{
    parse_get_status, ErrorInfo, Method, Request, Response, WorkspaceStatus, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

use crate::socket::{BoundSocket, EndpointError};
use crate::tracker::StatusTracker;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// What the query endpoint needs besides the tracker.
pub struct QueryContext {
    pub tracker: Arc<StatusTracker>,
    pub tick_interval_ms: u64,
}

pub struct QueryServer {
    socket: BoundSocket,
    context: Arc<QueryContext>,
}

impl QueryServer {
    pub fn bind(path: PathBuf, context: QueryContext) -> Result<Self, EndpointError> {
        let socket = BoundSocket::bind(path)?;
        info!(path = %socket.path().display(), "Query socket listening");
        Ok(Self {
            socket,
            context: Arc::new(context),
        })
    }

    pub async fn run(self) {
        loop {
            match self.socket.listener().accept().await {
                Ok((stream, _addr)) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &context).await {
                            debug!(error = %err, "Query connection closed with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %self.socket.path().display(),
                        "Failed to accept query connection"
                    );
                }
            }
        }
    }
}

pub async fn handle_connection<S>(stream: S, context: &QueryContext) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let request = match read_request(&mut reader).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read query request");
            return write_response(&mut write_half, &Response::error_with_info(None, err)).await;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Query request received");

    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
        return write_response(&mut write_half, &response).await;
    }

    if request.method == Method::Subscribe {
        return stream_changes(request.id, &mut reader, &mut write_half, context).await;
    }

    let response = handle_request(request, context);
    write_response(&mut write_half, &response).await
}

async fn read_request<R>(reader: &mut R) -> Result<Request, ErrorInfo>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut limited = (&mut *reader).take((MAX_REQUEST_BYTES + 1) as u64);
    let read = tokio::time::timeout(READ_TIMEOUT, limited.read_until(b'\n', &mut buffer))
        .await
        .map_err(|_| ErrorInfo::new("read_timeout", "request timed out"))?;

    if let Err(err) = read {
        return Err(ErrorInfo::new(
            "read_error",
            format!("failed to read request: {}", err),
        ));
    }

    if buffer.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "request_too_large",
            "request exceeded maximum size",
        ));
    }

    if buffer.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(&buffer).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &QueryContext) -> Response {
    let tracker = &context.tracker;
    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "subscribers": tracker.subscriber_count(),
                "watchdog": {
                    "tick_interval_ms": context.tick_interval_ms,
                    "working_timeout_ms": tracker.working_timeout_ms(),
                },
            }),
        ),
        Method::GetAllStatuses => match tracker.all_statuses() {
            Ok(statuses) => {
                debug!(statuses = statuses.len(), "All statuses snapshot");
                to_data(request.id, &statuses)
            }
            Err(err) => Response::error(
                request.id,
                "store_error",
                format!("Failed to fetch statuses: {}", err),
            ),
        },
        Method::GetStatus => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "workspace is required");
            };
            let parsed = match parse_get_status(params) {
                Ok(parsed) => parsed,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match tracker.status(&parsed.workspace) {
                Ok(status) => to_data(request.id, &status),
                Err(err) => Response::error(
                    request.id,
                    "store_error",
                    format!("Failed to fetch status: {}", err),
                ),
            }
        }
        Method::Subscribe => Response::error(
            request.id,
            "invalid_method",
            "subscribe must be handled as a stream",
        ),
    }
}

/// Subscribes before acknowledging, so no change after the ack is missed.
async fn stream_changes<R, W>(
    id: Option<String>,
    reader: &mut R,
    writer: &mut W,
    context: &QueryContext,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut changes = context.tracker.subscribe();
    write_response(writer, &Response::ok(id, serde_json::json!({ "subscribed": true }))).await?;
    info!("Status subscriber attached");

    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(status) => write_status(writer, &status).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status subscriber lagged; changes dropped");
                }
                Err(RecvError::Closed) => break,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                // Anything the client sends after subscribing is ignored.
                Ok(_) => {}
            },
        }
    }

    info!("Status subscriber detached");
    Ok(())
}

fn to_data<T: serde::Serialize>(id: Option<String>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json_line(writer, response).await
}

async fn write_status<W>(writer: &mut W, status: &WorkspaceStatus) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json_line(writer, status).await
}

async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
