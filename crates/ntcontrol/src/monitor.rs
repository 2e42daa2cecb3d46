//! Periodic polling of device status commands.
//!
//! NTCONTROL devices never push status; the only way to follow a value such
//! as power state or input selection is to query it repeatedly. A
//! [`Monitor`] polls a set of query commands on a fixed interval through a
//! shared [`Connection`] and emits [`MonitorEvent::ValueChanged`] whenever a
//! reply differs from the previous one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ntcontrol::{ConnectionBuilder, Monitor, MonitorEvent};
//!
//! # async fn example() -> ntcontrol::Result<()> {
//! let conn = Arc::new(ConnectionBuilder::new().host("192.168.0.8").build()?);
//! conn.connect().await?;
//!
//! let monitor = Monitor::spawn(Arc::clone(&conn), Duration::from_secs(1));
//! monitor.add_command("QPW").await;
//! let mut events = monitor.subscribe();
//! while let Ok(MonitorEvent::ValueChanged { command, value }) = events.recv().await {
//!     println!("{command} = {value}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use ntcontrol_core::error::Error;

use crate::connection::Connection;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An observation made by a [`Monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// `command` returned a value different from its previous reply, or its
    /// first reply since it was added or since the connection came back.
    ValueChanged { command: String, value: String },
    /// The device rejected `command` with its error reply.
    CommandRejected { command: String },
}

/// Background poller for a set of query commands.
pub struct Monitor {
    commands: Arc<Mutex<Vec<String>>>,
    event_tx: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Start polling on `connection` every `interval`.
    ///
    /// The command set starts empty. Polling is skipped while the connection
    /// is not ready; the last known values are forgotten then, so every
    /// command reports afresh after a reconnect.
    pub fn spawn(connection: Arc<Connection>, interval: Duration) -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(poll_loop(
            connection,
            interval,
            Arc::clone(&commands),
            event_tx.clone(),
            cancel.clone(),
        ));

        Monitor {
            commands,
            event_tx,
            cancel,
            task: Some(task),
        }
    }

    /// Add `command` to the polled set. Adding a command twice has no effect.
    pub async fn add_command(&self, command: impl Into<String>) {
        let command = command.into();
        let mut commands = self.commands.lock().await;
        if !commands.contains(&command) {
            debug!(command = %command, "monitoring command");
            commands.push(command);
        }
    }

    /// Stop polling `command`.
    pub async fn remove_command(&self, command: &str) {
        self.commands.lock().await.retain(|c| c != command);
    }

    /// The commands currently polled, in the order they were added.
    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Stop polling and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    connection: Arc<Connection>,
    interval: Duration,
    commands: Arc<Mutex<Vec<String>>>,
    event_tx: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("monitor stopped");
                break;
            }

            _ = ticker.tick() => {}
        }

        if !connection.is_ready() {
            last.clear();
            continue;
        }

        let snapshot = commands.lock().await.clone();
        last.retain(|command, _| snapshot.contains(command));

        for command in snapshot {
            if cancel.is_cancelled() {
                return;
            }
            match connection.send_command(&command).await {
                Ok(value) => {
                    if last.get(&command) != Some(&value) {
                        trace!(command = %command, value = %value, "monitored value changed");
                        last.insert(command.clone(), value.clone());
                        let _ = event_tx.send(MonitorEvent::ValueChanged { command, value });
                    }
                }
                Err(Error::Device(_)) => {
                    let _ = event_tx.send(MonitorEvent::CommandRejected { command });
                }
                Err(e) if e.is_fatal() => {
                    debug!(error = %e, "monitor poll interrupted");
                    last.clear();
                    break;
                }
                Err(e) => debug!(command = %command, error = %e, "monitor poll failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionBuilder;
    use ntcontrol_test_harness::MockTransport;

    async fn next_event(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("monitor event")
            .expect("channel open")
    }

    #[tokio::test(start_paused = true)]
    async fn reports_first_value_and_changes_only() {
        let mut mock = MockTransport::with_greeting(b"NTCONTROL 0\r");
        mock.expect(b"0000QPW\r", b"000\r");
        mock.expect(b"0000QPW\r", b"000\r");
        mock.expect(b"0000QPW\r", b"001\r");

        let conn = Arc::new(ConnectionBuilder::new().build().unwrap());
        conn.connect_with_transport(Box::new(mock)).await.unwrap();

        let monitor = Monitor::spawn(Arc::clone(&conn), Duration::from_secs(1));
        let mut events = monitor.subscribe();
        monitor.add_command("QPW").await;

        assert_eq!(
            next_event(&mut events).await,
            MonitorEvent::ValueChanged {
                command: "QPW".into(),
                value: "0".into()
            }
        );
        // The unchanged second reading is not reported.
        assert_eq!(
            next_event(&mut events).await,
            MonitorEvent::ValueChanged {
                command: "QPW".into(),
                value: "1".into()
            }
        );

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_rejection_is_reported() {
        let mut mock = MockTransport::with_greeting(b"NTCONTROL 0\r");
        mock.expect(b"0000QXX\r", b"00ERRA\r");

        let conn = Arc::new(ConnectionBuilder::new().build().unwrap());
        conn.connect_with_transport(Box::new(mock)).await.unwrap();

        let monitor = Monitor::spawn(Arc::clone(&conn), Duration::from_secs(1));
        let mut events = monitor.subscribe();
        monitor.add_command("QXX").await;
        assert_eq!(
            next_event(&mut events).await,
            MonitorEvent::CommandRejected {
                command: "QXX".into()
            }
        );
        monitor.remove_command("QXX").await;
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn command_set_management() {
        let conn = Arc::new(ConnectionBuilder::new().build().unwrap());
        let monitor = Monitor::spawn(conn, Duration::from_secs(60));

        monitor.add_command("QPW").await;
        monitor.add_command("QIN").await;
        monitor.add_command("QPW").await;
        assert_eq!(monitor.commands().await, vec!["QPW", "QIN"]);

        monitor.remove_command("QPW").await;
        assert_eq!(monitor.commands().await, vec!["QIN"]);
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_while_disconnected() {
        let conn = Arc::new(ConnectionBuilder::new().build().unwrap());
        let monitor = Monitor::spawn(Arc::clone(&conn), Duration::from_millis(100));
        let mut events = monitor.subscribe();
        monitor.add_command("QPW").await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());
        monitor.shutdown().await;
    }
}
