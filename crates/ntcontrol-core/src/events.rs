//! Connection lifecycle states and events.
//!
//! Every NTCONTROL connection moves through the states of [`ConnectionState`].
//! Transitions, handshake results, and received frames are published as
//! [`ConnectionEvent`]s on a `tokio::sync::broadcast` channel so a
//! supervising component can show status and drive reconnects.

use std::fmt;

/// Lifecycle state of a connection.
///
/// ```text
/// Disconnected -> Connecting -> AwaitingGreeting -> Ready <-> AwaitingResponse
///       ^                                                           |
///       +------------------ transport error ------------------------+
/// any state --destroy()--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport. Commands fail immediately with `NotConnected`.
    Disconnected,
    /// Transport is being established.
    Connecting,
    /// Transport is up; waiting for the device greeting.
    AwaitingGreeting,
    /// Handshake complete and no command in flight.
    Ready,
    /// A command has been transmitted and awaits its reply.
    AwaitingResponse,
    /// Terminal. No further operations are accepted.
    Closed,
}

impl ConnectionState {
    /// Whether commands can be accepted in this state.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::AwaitingResponse)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingGreeting => "awaiting greeting",
            ConnectionState::Ready => "ready",
            ConnectionState::AwaitingResponse => "awaiting response",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An event emitted by a connection.
///
/// Events are delivered best effort through a bounded broadcast channel.
/// Slow subscribers may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The lifecycle state changed.
    StateChanged(ConnectionState),

    /// The handshake completed and the connection is ready for commands.
    Connected,

    /// The device greeting was accepted.
    HandshakeComplete {
        /// `true` if the device requires an authentication token.
        protected: bool,
    },

    /// A frame arrived after the handshake (terminator stripped).
    FrameReceived(String),

    /// The connection was lost or torn down.
    Disconnected,
}
