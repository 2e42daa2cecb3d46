//! Mock transport for deterministic testing of the protocol client.
//!
//! [`MockTransport`] implements the [`Transport`] trait as a scripted device:
//! an optional greeting delivered before anything is sent, followed by
//! ordered request/reply expectations. It lets tests check exact wire bytes
//! without a socket.
//!
//! # Example
//!
//! ```
//! use ntcontrol_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::with_greeting(b"NTCONTROL 0\r");
//! // When the client sends "0000PON\r", answer "00PON\r".
//! mock.expect(b"0000PON\r", b"00PON\r");
//! // When it sends "0000QPW\r", never answer.
//! mock.expect_silence(b"0000QPW\r");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ntcontrol_core::error::{Error, Result};
use ntcontrol_core::transport::Transport;

/// What the scripted device does after a matching request.
#[derive(Debug, Clone)]
enum Reply {
    /// Queue these bytes for the client to read.
    Bytes(Vec<u8>),
    /// Accept the request and never answer.
    Silence,
    /// Accept the request, then drop the connection.
    Disconnect,
}

/// A pre-loaded request/reply pair.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    reply: Reply,
}

#[derive(Debug, Default)]
struct LogInner {
    sent: Vec<Vec<u8>>,
    overlapping_sends: usize,
}

/// Shared record of what a [`MockTransport`] saw.
///
/// The transport is usually boxed and moved into the client's IO task, so
/// tests keep a `MockLog` clone to inspect the wire afterwards.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<LogInner>>,
}

impl MockLog {
    /// Every `send()` payload, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Number of `send()` calls made while an earlier reply was still
    /// being delivered.
    ///
    /// A strictly one-at-a-time client keeps this at zero.
    pub fn overlapping_sends(&self) -> usize {
        self.lock().overlapping_sends
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        // A panicking test thread poisons the lock; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A mock [`Transport`] scripted like an NTCONTROL device.
///
/// Expectations are consumed in order. A matching `send()` queues the
/// scripted reply, which subsequent `receive()` calls return, at most
/// `chunk_size` bytes at a time. When nothing is queued, `receive()` waits
/// for the full timeout and returns [`Error::Timeout`], so the mock behaves
/// like a silent socket under tokio's paused clock.
///
/// A mismatched or unexpected `send()` returns [`Error::Protocol`].
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be read by the client.
    inbound: VecDeque<u8>,
    /// Maximum bytes returned per `receive()` call.
    chunk_size: usize,
    /// Whether a scripted reply is still being delivered.
    reply_in_progress: bool,
    /// Set after a `Disconnect` expectation fires.
    lost: bool,
    connected: bool,
    log: MockLog,
}

impl MockTransport {
    /// Create a connected mock with no greeting.
    pub fn new() -> Self {
        MockTransport {
            expectations: VecDeque::new(),
            inbound: VecDeque::new(),
            chunk_size: usize::MAX,
            reply_in_progress: false,
            lost: false,
            connected: true,
            log: MockLog::default(),
        }
    }

    /// Create a connected mock that sends `greeting` before anything else.
    pub fn with_greeting(greeting: &[u8]) -> Self {
        let mut mock = Self::new();
        mock.inbound.extend(greeting);
        mock
    }

    /// Expect `request` and answer with `reply`.
    ///
    /// `reply` may hold several frames, a partial frame, or nothing.
    pub fn expect(&mut self, request: &[u8], reply: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply: Reply::Bytes(reply.to_vec()),
        });
    }

    /// Expect `request` and never answer it.
    pub fn expect_silence(&mut self, request: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply: Reply::Silence,
        });
    }

    /// Expect `request`, then drop the connection.
    ///
    /// Later `send()` and `receive()` calls return [`Error::ConnectionLost`].
    pub fn expect_disconnect(&mut self, request: &[u8]) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply: Reply::Disconnect,
        });
    }

    /// Deliver inbound bytes at most `n` at a time.
    pub fn set_chunk_size(&mut self, n: usize) {
        self.chunk_size = n.max(1);
    }

    /// A handle to the wire log that outlives the transport.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }

    /// Number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.lost {
            return Err(Error::ConnectionLost);
        }

        {
            let mut log = self.log.lock();
            log.sent.push(data.to_vec());
            if self.reply_in_progress {
                log.overlapping_sends += 1;
            }
        }

        let expectation = self.expectations.pop_front().ok_or_else(|| {
            Error::Protocol(format!(
                "no more expectations in mock transport, got {:?}",
                String::from_utf8_lossy(data)
            ))
        })?;

        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }

        match expectation.reply {
            Reply::Bytes(bytes) => {
                self.reply_in_progress = !bytes.is_empty();
                self.inbound.extend(bytes);
            }
            Reply::Silence => {}
            Reply::Disconnect => self.lost = true,
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.lost {
            return Err(Error::ConnectionLost);
        }

        if self.inbound.is_empty() {
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout);
        }

        let n = self.inbound.len().min(buf.len()).min(self.chunk_size);
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        if self.inbound.is_empty() {
            self.reply_in_progress = false;
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.inbound.clear();
        self.reply_in_progress = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.lost
    }
}
