//! Transport implementations for the NTCONTROL client.
//!
//! This crate provides [`TcpTransport`], the tokio TCP implementation of the
//! [`Transport`](ntcontrol_core::Transport) trait from `ntcontrol-core`.
//!
//! # Example
//!
//! ```no_run
//! use ntcontrol_transport::TcpTransport;
//! use ntcontrol_core::transport::Transport;
//!
//! # async fn example() -> ntcontrol_core::Result<()> {
//! let mut transport = TcpTransport::connect("192.168.0.8", 1024).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod tcp;

pub use tcp::{DEFAULT_CONNECT_TIMEOUT, TcpTransport};
