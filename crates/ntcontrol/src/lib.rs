//! Async client for the NTCONTROL device-control protocol.
//!
//! NTCONTROL is a carriage-return-framed ASCII protocol spoken over TCP
//! (port 1024 by default) by networked projectors and displays. A device
//! greets each new connection, optionally with a nonce that the client must
//! answer with an MD5 token on every command, and then answers commands
//! strictly one at a time.
//!
//! # Architecture
//!
//! - [`protocol`] -- framing, greeting parsing, command encoding, reply decoding
//! - [`session`] -- credentials and the per-connection token
//! - [`dispatcher`] -- FIFO command queue and reply correlation
//! - [`connection`] -- the public [`Connection`] handle and its IO task
//! - [`builder`] -- [`ConnectionBuilder`] and [`ConnectionOptions`]
//! - [`monitor`] -- periodic polling of status queries
//!
//! # Example
//!
//! ```no_run
//! use ntcontrol::ConnectionBuilder;
//!
//! # async fn example() -> ntcontrol::Result<()> {
//! let conn = ConnectionBuilder::new()
//!     .host("192.168.0.8")
//!     .credentials("admin1", "panasonic")
//!     .build()?;
//! conn.connect().await?;
//! conn.send_command("PON").await?;
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod connection;
pub mod dispatcher;
mod io;
pub mod monitor;
pub mod protocol;
pub mod session;
mod state;

pub use builder::{ConnectionBuilder, ConnectionOptions, DEFAULT_PORT};
pub use connection::Connection;
pub use monitor::{Monitor, MonitorEvent};
pub use session::{Credentials, digest};

pub use ntcontrol_core::{ConnectionEvent, ConnectionState, Error, Result, Transport};
