//! ConnectionBuilder -- fluent builder for [`Connection`] instances.
//!
//! Separates configuration from connecting so that callers can set the
//! address, credentials, and timeouts before any socket is opened.
//!
//! # Example
//!
//! ```no_run
//! use ntcontrol::ConnectionBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> ntcontrol::Result<()> {
//! let conn = ConnectionBuilder::new()
//!     .host("192.168.0.8")
//!     .credentials("admin1", "panasonic")
//!     .command_timeout(Some(Duration::from_secs(2)))
//!     .build()?;
//! conn.connect().await?;
//! let power = conn.send_command("QPW").await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use ntcontrol_core::error::{Error, Result};

use crate::connection::Connection;
use crate::protocol::DEFAULT_REPLY_PREFIX_LEN;
use crate::session::Credentials;

/// Default NTCONTROL TCP port.
pub const DEFAULT_PORT: u16 = 1024;

/// Default per-command reply timeout (2 seconds).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time allowed for the TCP connect (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for the device greeting (5 seconds).
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the command submission channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Settings for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Device host name or address. Required by [`Connection::connect`].
    pub host: Option<String>,
    /// Device TCP port.
    pub port: u16,
    /// Credentials for protected mode.
    pub credentials: Option<Credentials>,
    /// Reply timeout for [`Connection::send_command`], measured from
    /// transmission. `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    /// Bytes stripped from the front of every reply frame.
    pub reply_prefix_len: usize,
    pub queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            credentials: None,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            greeting_timeout: DEFAULT_GREETING_TIMEOUT,
            reply_prefix_len: DEFAULT_REPLY_PREFIX_LEN,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Fluent builder for [`Connection`].
///
/// Every setting has a default, so the simplest usage is:
///
/// ```ignore
/// let conn = ConnectionBuilder::new().host("192.168.0.8").build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    options: ConnectionOptions,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device host name or IP address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = Some(host.into());
        self
    }

    /// Override the TCP port (default: 1024).
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Set the username and password used if the device is protected.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Set the reply timeout (default: 2s). `None` disables it.
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.command_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for the device greeting (default: 5s).
    pub fn greeting_timeout(mut self, timeout: Duration) -> Self {
        self.options.greeting_timeout = timeout;
        self
    }

    /// Override the reply prefix width (default: 2).
    pub fn reply_prefix_len(mut self, len: usize) -> Self {
        self.options.reply_prefix_len = len;
        self
    }

    /// Set the command submission channel capacity (default: 32).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity;
        self
    }

    /// Validate the settings and build an unconnected [`Connection`].
    pub fn build(self) -> Result<Connection> {
        let opts = &self.options;
        if let Some(host) = &opts.host {
            if host.trim().is_empty() {
                return Err(Error::InvalidParameter("host must not be empty".into()));
            }
        }
        if opts.port == 0 {
            return Err(Error::InvalidParameter("port must be non-zero".into()));
        }
        if opts.queue_capacity == 0 {
            return Err(Error::InvalidParameter(
                "queue capacity must be non-zero".into(),
            ));
        }
        if opts.connect_timeout.is_zero() || opts.greeting_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "connect and greeting timeouts must be non-zero".into(),
            ));
        }
        if opts.command_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidParameter(
                "command timeout must be non-zero; use None to disable it".into(),
            ));
        }
        Ok(Connection::new(self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntcontrol_core::events::ConnectionState;

    #[test]
    fn defaults() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.port, 1024);
        assert_eq!(opts.command_timeout, Some(Duration::from_secs(2)));
        assert_eq!(opts.reply_prefix_len, 2);
        assert!(opts.host.is_none());
        assert!(opts.credentials.is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let conn = ConnectionBuilder::new()
            .host("10.0.0.5")
            .port(2024)
            .credentials("admin1", "panasonic")
            .command_timeout(None)
            .reply_prefix_len(3)
            .build()
            .unwrap();

        let opts = conn.options();
        assert_eq!(opts.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(opts.port, 2024);
        assert_eq!(opts.command_timeout, None);
        assert_eq!(opts.reply_prefix_len, 3);
        assert_eq!(
            opts.credentials,
            Some(Credentials::new("admin1", "panasonic"))
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn rejects_bad_settings() {
        let cases = [
            ConnectionBuilder::new().host("  "),
            ConnectionBuilder::new().port(0),
            ConnectionBuilder::new().queue_capacity(0),
            ConnectionBuilder::new().greeting_timeout(Duration::ZERO),
            ConnectionBuilder::new().command_timeout(Some(Duration::ZERO)),
        ];
        for builder in cases {
            let err = builder.build().unwrap_err();
            assert!(matches!(err, Error::InvalidParameter(_)));
        }
    }

    #[test]
    fn host_is_optional_until_connect() {
        assert!(ConnectionBuilder::new().build().is_ok());
    }
}
