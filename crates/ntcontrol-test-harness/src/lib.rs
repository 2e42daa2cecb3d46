//! ntcontrol-test-harness: Mock transports and scripted devices for
//! testing the NTCONTROL client.
//!
//! [`MockTransport`] is an in-process scripted device for unit tests of the
//! protocol engine. [`MockTcpServer`] is the same idea on a real localhost
//! socket, for end-to-end tests of connect and handshake.

pub mod mock_tcp;
pub mod mock_transport;

pub use mock_tcp::MockTcpServer;
pub use mock_transport::{MockLog, MockTransport};
