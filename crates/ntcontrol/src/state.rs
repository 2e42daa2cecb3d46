//! Shared connection state and event fan-out.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use ntcontrol_core::events::{ConnectionEvent, ConnectionState};

/// Capacity of the event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The current [`ConnectionState`] plus the event channel that announces
/// changes to it.
///
/// Cloned into the IO task so both the connection handle and the task can
/// drive transitions. `Closed` is terminal: once set, further transitions
/// are ignored.
#[derive(Clone)]
pub(crate) struct StateCell {
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        StateCell {
            state: Arc::new(state),
            events,
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`, emitting [`ConnectionEvent::StateChanged`] if the
    /// state actually changed.
    pub(crate) fn set(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            debug!(from = %previous, to = %next, "connection state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
        changed
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
