//! Error types for the NTCONTROL client.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, handshake and framing
//! violations, device-reported errors, and per-command timeouts are all
//! captured here.

/// The error type for all NTCONTROL operations.
///
/// Variants fall into five classes:
///
/// - protocol: [`Protocol`](Error::Protocol)
/// - device: [`Device`](Error::Device)
/// - transport: [`Transport`](Error::Transport), [`ConnectionLost`](Error::ConnectionLost),
///   [`NotConnected`](Error::NotConnected), [`Io`](Error::Io)
/// - timeout: [`Timeout`](Error::Timeout)
/// - queue anomaly: [`QueueAnomaly`](Error::QueueAnomaly), which is logged and never
///   returned to a caller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (refused connection, socket failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected greeting, malformed reply frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device answered with its canonical error frame.
    #[error("device error: {0}")]
    Device(String),

    /// Timed out waiting for the device.
    ///
    /// For commands this means no reply arrived before the command's
    /// deadline. The queue moves on to the next command.
    #[error("timeout waiting for response")]
    Timeout,

    /// A frame arrived while no command was outstanding.
    #[error("unsolicited frame: {0}")]
    QueueAnomaly(String),

    /// An invalid parameter was passed to a client operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the device has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the device was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection has been destroyed and accepts no further operations.
    #[error("connection closed")]
    Closed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the transport class.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionLost | Error::NotConnected | Error::Io(_)
        )
    }

    /// Whether this error forces the connection back to `Disconnected`.
    ///
    /// Transport and protocol errors are connection-fatal. Device errors,
    /// timeouts, and queue anomalies only affect a single command.
    pub fn is_fatal(&self) -> bool {
        self.is_transport() || matches!(self, Error::Protocol(_))
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("connection refused: 10.0.0.5:1024".into());
        assert_eq!(
            e.to_string(),
            "transport error: connection refused: 10.0.0.5:1024"
        );
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("unexpected greeting".into());
        assert_eq!(e.to_string(), "protocol error: unexpected greeting");
    }

    #[test]
    fn error_display_device() {
        let e = Error::Device("00ERRA".into());
        assert_eq!(e.to_string(), "device error: 00ERRA");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_queue_anomaly() {
        let e = Error::QueueAnomaly("00OK".into());
        assert_eq!(e.to_string(), "unsolicited frame: 00OK");
    }

    #[test]
    fn error_display_closed() {
        assert_eq!(Error::Closed.to_string(), "connection closed");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn transport_class() {
        assert!(Error::Transport("x".into()).is_transport());
        assert!(Error::ConnectionLost.is_transport());
        assert!(Error::NotConnected.is_transport());
        assert!(Error::Io(std::io::Error::other("x")).is_transport());

        assert!(!Error::Timeout.is_transport());
        assert!(!Error::Device("00ERRA".into()).is_transport());
        assert!(!Error::Protocol("x".into()).is_transport());
    }

    #[test]
    fn fatal_class() {
        assert!(Error::ConnectionLost.is_fatal());
        assert!(Error::Protocol("short reply".into()).is_fatal());

        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Device("00ERRA".into()).is_fatal());
        assert!(!Error::QueueAnomaly("00OK".into()).is_fatal());
        assert!(!Error::Closed.is_fatal());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
