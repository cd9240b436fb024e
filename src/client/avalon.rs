use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::{CollectError, RetryPolicy};
use crate::protocol::avalon as codec;

/// TCP port of the cgminer-compatible API on Avalon devices.
const API_PORT: u16 = 4028;

/// Literal command that reboots the machine over the same socket protocol
/// used for telemetry.
const REBOOT_COMMAND: &str = "ascset|0,reboot,0";

/// Raw-socket client for Avalon devices.
///
/// The device closes the connection after writing its full response, with
/// no length prefix or terminator, so frames are read until EOF under a
/// deadline. A connection that yields no bytes at all is an explicit
/// failure rather than a hang.
#[derive(Clone)]
pub struct AvalonClient {
    io_timeout: Duration,
    retry: RetryPolicy,
}

impl AvalonClient {
    pub fn new(io_timeout: Duration, retry: RetryPolicy) -> Self {
        Self { io_timeout, retry }
    }

    /// Issue one API command and return the raw response text.
    pub async fn request(&self, ip: &str, command: &str) -> Result<String, CollectError> {
        let addr = format!("{ip}:{API_PORT}");

        self.retry
            .run(|_attempt| {
                let addr = addr.clone();
                let command = command.to_string();
                let io_timeout = self.io_timeout;
                async move { request_addr(&addr, &command, io_timeout).await }
            })
            .await
    }

    /// One-shot restart directive. Success is signalled by an `S` status
    /// token in the response; any failure is logged and reported as false.
    pub async fn restart(&self, ip: &str, device_id: &str) -> bool {
        info!(device = device_id, ip, "sending restart command");

        match self.request(ip, REBOOT_COMMAND).await {
            Ok(text) => {
                let fields = codec::parse_response(&text);
                let accepted = fields.get("STATUS").map(|s| s == "S").unwrap_or(false);
                if accepted {
                    info!(device = device_id, "restart command accepted");
                } else {
                    warn!(device = device_id, response = %text, "restart command not acknowledged");
                }
                accepted
            }
            Err(e) => {
                warn!(device = device_id, error = %e, "restart command failed");
                false
            }
        }
    }
}

async fn request_addr(
    addr: &str,
    command: &str,
    io_timeout: Duration,
) -> Result<String, CollectError> {
    let mut stream = tokio::time::timeout(io_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| CollectError::Transport(format!("connect to {addr} timed out")))?
        .map_err(|e| CollectError::Transport(format!("connect to {addr}: {e}")))?;

    let payload = serde_json::json!({ "command": command }).to_string();
    stream
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| CollectError::Transport(format!("write to {addr}: {e}")))?;

    // Read until the device closes the connection. A deadline mid-stream
    // keeps whatever arrived; partial frames degrade in the codec, not here.
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(io_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                return Err(CollectError::Transport(format!("read from {addr}: {e}")))
            }
            Err(_) => break,
        }
    }

    // Firmware pads responses with NULs
    let text = String::from_utf8_lossy(&response)
        .replace('\0', "")
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(CollectError::EmptyResponse);
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            // Dropping the socket is the only end-of-frame signal
        });
        addr
    }

    #[tokio::test]
    async fn reads_until_eof_and_strips_nuls() {
        let addr = serve_once(b"STATUS=S,Code=11|SUMMARY,MHS av=3542.77|\0\0").await;
        let text = request_addr(&addr, "summary", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(text.contains("MHS av=3542.77"));
        assert!(!text.contains('\0'));
    }

    #[tokio::test]
    async fn empty_read_is_an_explicit_failure() {
        let addr = serve_once(b"\0\0").await;
        match request_addr(&addr, "summary", Duration::from_secs(5)).await {
            Err(CollectError::EmptyResponse) => {}
            other => panic!("expected EmptyResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Bind and immediately drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match request_addr(&addr, "summary", Duration::from_secs(2)).await {
            Err(CollectError::Transport(_)) => {}
            other => panic!("expected Transport, got {other:?}"),
        }
    }
}
