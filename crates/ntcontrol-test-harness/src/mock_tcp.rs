//! Mock TCP device for end-to-end connection tests.
//!
//! [`MockTcpServer`] listens on a random localhost port and plays a scripted
//! NTCONTROL device: it sends a greeting on accept, then answers each
//! expected request in order. This exercises the real TCP transport and the
//! full connect/handshake path without hardware.
//!
//! # Example
//!
//! ```
//! use ntcontrol_test_harness::MockTcpServer;
//!
//! # async fn example() -> ntcontrol_core::Result<()> {
//! let mut server = MockTcpServer::new(b"NTCONTROL 0\r").await?;
//! server.expect(b"0000PON\r", b"00PON\r");
//! server.start();
//!
//! let (host, port) = (server.host(), server.port());
//! // ... connect a client and test ...
//! # Ok(())
//! # }
//! ```

use ntcontrol_core::error::{Error, Result};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One scripted exchange.
#[derive(Debug, Clone)]
struct TcpExpectation {
    /// The exact bytes we expect the client to send.
    request: Vec<u8>,
    /// Bytes to write back; `None` closes the connection instead.
    response: Option<Vec<u8>>,
}

/// A scripted NTCONTROL device on a localhost TCP port.
///
/// Once [`start`](MockTcpServer::start) is called, the server accepts a
/// single connection, writes the greeting, and processes expectations in
/// order. A request that does not match ends the script with an error,
/// reported by [`wait`](MockTcpServer::wait).
pub struct MockTcpServer {
    listener: Option<TcpListener>,
    port: u16,
    greeting: Vec<u8>,
    expectations: VecDeque<TcpExpectation>,
    /// Keep the socket open after the last expectation until the client closes.
    linger: bool,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Bind a new server on a random port with the given greeting bytes.
    pub async fn new(greeting: &[u8]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {}", e)))?;
        let port = listener.local_addr().map_err(Error::Io)?.port();

        Ok(Self {
            listener: Some(listener),
            port,
            greeting: greeting.to_vec(),
            expectations: VecDeque::new(),
            linger: true,
            server_handle: None,
        })
    }

    /// Expect `request` and answer with `response`.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(TcpExpectation {
            request: request.to_vec(),
            response: Some(response.to_vec()),
        });
    }

    /// Expect `request`, then close the connection without answering.
    pub fn expect_then_close(&mut self, request: &[u8]) {
        self.expectations.push_back(TcpExpectation {
            request: request.to_vec(),
            response: None,
        });
    }

    /// Close the socket as soon as the script is exhausted instead of
    /// waiting for the client to hang up.
    pub fn close_when_done(&mut self) {
        self.linger = false;
    }

    /// The host the server listens on.
    pub fn host(&self) -> &str {
        "127.0.0.1"
    }

    /// The port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start serving in a background task.
    ///
    /// Calling `start` twice has no effect.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let greeting = std::mem::take(&mut self.greeting);
        let expectations: Vec<TcpExpectation> = self.expectations.drain(..).collect();
        let linger = self.linger;

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;

            stream
                .write_all(&greeting)
                .await
                .map_err(|e| format!("greeting write error: {}", e))?;

            for (i, expectation) in expectations.iter().enumerate() {
                let mut buf = vec![0u8; expectation.request.len()];
                let mut total_read = 0;

                while total_read < expectation.request.len() {
                    let n = stream
                        .read(&mut buf[total_read..])
                        .await
                        .map_err(|e| format!("expectation {}: read error: {}", i, e))?;
                    if n == 0 {
                        return Err(format!(
                            "expectation {}: client disconnected after {} bytes (expected {})",
                            i,
                            total_read,
                            expectation.request.len()
                        ));
                    }
                    total_read += n;
                }

                if buf != expectation.request {
                    tracing::debug!(
                        expectation = i,
                        expected = %String::from_utf8_lossy(&expectation.request).escape_debug(),
                        got = %String::from_utf8_lossy(&buf).escape_debug(),
                        "mock TCP request mismatch"
                    );
                    return Err(format!(
                        "expectation {}: request mismatch: expected {:?}, got {:?}",
                        i,
                        String::from_utf8_lossy(&expectation.request),
                        String::from_utf8_lossy(&buf)
                    ));
                }

                match &expectation.response {
                    Some(response) => stream
                        .write_all(response)
                        .await
                        .map_err(|e| format!("expectation {}: write error: {}", i, e))?,
                    None => return Ok(()),
                }
            }

            if linger {
                // Hold the socket until the client hangs up.
                let mut sink = [0u8; 64];
                while let Ok(n) = stream.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            }

            Ok(())
        });

        self.server_handle = Some(handle);
    }

    /// Wait for the script to finish and return any mismatch.
    pub async fn wait(self) -> std::result::Result<(), String> {
        if let Some(handle) = self.server_handle {
            handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?
        } else {
            Ok(())
        }
    }

    /// Stop the server task without waiting for the script.
    pub fn abort(&self) {
        if let Some(handle) = &self.server_handle {
            handle.abort();
        }
    }
}
