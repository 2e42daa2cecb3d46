//! Transport trait for device communication.
//!
//! The [`Transport`] trait abstracts over the byte stream to a device. The
//! production implementation is the TCP transport in `ntcontrol-transport`;
//! `ntcontrol-test-harness` provides a scripted mock for deterministic tests.
//!
//! The protocol client operates on a boxed `Transport` rather than on a
//! socket directly, so the same handshake and dispatch code runs against
//! real devices and against the mock.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a device.
///
/// Implementations deliver raw bytes only. Framing, the greeting handshake,
/// and command correlation belong to the protocol client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the device.
    ///
    /// Implementations should not return until all bytes have been handed to
    /// the underlying socket.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the device into the provided buffer.
    ///
    /// Returns the number of bytes read, which may cover a partial frame or
    /// several frames at once. Waits up to `timeout` for data to arrive and
    /// returns [`Error::Timeout`](crate::error::Error::Timeout) if none does.
    /// A peer that closes the stream yields
    /// [`Error::ConnectionLost`](crate::error::Error::ConnectionLost).
    ///
    /// Implementations must be cancel safe: dropping the returned future
    /// before it completes must not lose bytes.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
