//! Client helpers for the workspace status daemon.
//!
//! Status events go to the ingestion socket as one fire-and-forget line.
//! Queries go to the query socket as one JSON request, one JSON response.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use workspace_status_protocol::{
    Method, Request, Response, StatusLine, WorkspaceStatus, MAX_REQUEST_BYTES, QUERY_SOCKET_ENV,
    QUERY_SOCKET_SUFFIX, STATUS_SOCKET_ENV, STATUS_SOCKET_NAME,
};

const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn status_socket_path() -> PathBuf {
    if let Some(path) = env_path(STATUS_SOCKET_ENV) {
        return path;
    }
    env_path("XDG_RUNTIME_DIR")
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(STATUS_SOCKET_NAME)
}

pub fn query_socket_path() -> PathBuf {
    if let Some(path) = env_path(QUERY_SOCKET_ENV) {
        return path;
    }
    let mut path = status_socket_path().into_os_string();
    path.push(QUERY_SOCKET_SUFFIX);
    PathBuf::from(path)
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Sends one status line, retrying once after a short delay.
pub fn send_with_retry(line: &StatusLine) -> Result<(), String> {
    match send_status_line(line) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, workspace = %line.workspace, "Failed to send status event");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_status_line(line).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    workspace = %line.workspace,
                    "Retry failed sending status event"
                );
                retry_err
            })
        }
    }
}

fn send_status_line(line: &StatusLine) -> Result<(), String> {
    let socket = status_socket_path();
    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        format!(
            "Failed to connect to status socket {}: {}",
            socket.display(),
            err
        )
    })?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    stream
        .write_all(line.to_wire().as_bytes())
        .map_err(|err| format!("Failed to write status line: {}", err))?;
    stream.flush().ok();
    let _ = stream.shutdown(Shutdown::Write);
    tracing::debug!(workspace = %line.workspace, verb = %line.verb, "Status event sent");
    Ok(())
}

pub fn fetch_all_statuses() -> Result<Vec<WorkspaceStatus>, String> {
    let mut request = Request::new(Method::GetAllStatuses);
    request.id = Some("list".to_string());
    let data = expect_ok(send_request(request)?)?;
    serde_json::from_value(data).map_err(|err| format!("Failed to decode statuses: {}", err))
}

/// Streams status changes to `on_change` until it returns `false` or the
/// daemon closes the connection.
pub fn watch<F>(mut on_change: F) -> Result<(), String>
where
    F: FnMut(WorkspaceStatus) -> bool,
{
    let mut request = Request::new(Method::Subscribe);
    request.id = Some("watch".to_string());
    let mut stream = open_request(&request)?;
    let ack = read_response(&mut stream)?;
    expect_ok(ack)?;

    // Changes may be minutes apart.
    let _ = stream.set_read_timeout(None);
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|err| format!("Failed to read status change: {}", err))?;
        if n == 0 {
            return Err("Daemon closed the subscription".to_string());
        }
        match serde_json::from_str::<WorkspaceStatus>(line.trim_end()) {
            Ok(status) => {
                if !on_change(status) {
                    return Ok(());
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping undecodable status change");
            }
        }
    }
}

fn expect_ok(response: Response) -> Result<serde_json::Value, String> {
    if response.ok {
        return Ok(response.data.unwrap_or(serde_json::Value::Null));
    }
    Err(response
        .error
        .map(|err| format!("{}: {}", err.code, err.message))
        .unwrap_or_else(|| "Unknown daemon error".to_string()))
}

fn send_request(request: Request) -> Result<Response, String> {
    let mut stream = open_request(&request)?;
    read_response(&mut stream)
}

fn open_request(request: &Request) -> Result<UnixStream, String> {
    let socket = query_socket_path();
    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        format!(
            "Failed to connect to query socket {}: {}",
            socket.display(),
            err
        )
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();
    Ok(stream)
}

/// Reads exactly one response line. Bytes are pulled one at a time so a
/// subscription stream that follows the ack is left unread.
fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buffer.push(byte[0]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    if buffer.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(&buffer)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}
