//! ntcontrol-core: Core traits, types, and error definitions for the
//! NTCONTROL client.
//!
//! This crate holds the abstractions shared by the protocol client, the
//! transports, and the test harness. Binding layers that only need to react
//! to connection status can depend on it without pulling in tokio networking.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`ConnectionState`] / [`ConnectionEvent`] -- lifecycle notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;

pub use error::{Error, Result};
pub use events::{ConnectionEvent, ConnectionState};
pub use transport::Transport;
