//! IO task for an established NTCONTROL session.
//!
//! One tokio task owns the transport exclusively for the lifetime of a
//! session. Callers submit commands through a channel; the task queues them
//! in a [`Dispatcher`], transmits one at a time, feeds received bytes through
//! the [`FrameAssembler`], and resolves each caller's oneshot with the
//! matching reply. A transport failure ends the task and fails everything
//! still pending.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use ntcontrol_core::error::{Error, Result};
use ntcontrol_core::events::{ConnectionEvent, ConnectionState};
use ntcontrol_core::transport::Transport;

use crate::dispatcher::{Dispatcher, PendingCommand};
use crate::protocol::FrameAssembler;
use crate::state::StateCell;

/// How long a single receive waits before the loop re-checks its other arms.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Size of the scratch buffer for one receive call.
const RECV_BUF_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A request sent from the connection handle to the IO task.
pub(crate) enum Request {
    /// Queue a command for transmission.
    Command(PendingCommand),
    /// Fail everything pending, close the transport, and exit.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable sender half used to submit commands.
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::Sender<Request>,
}

impl CommandSender {
    /// Queue `body` and wait for its reply.
    pub(crate) async fn command(&self, body: &str, timeout: Option<Duration>) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Command(PendingCommand::new(body, timeout, reply_tx)))
            .await
            .map_err(|_| Error::NotConnected)?;

        // The IO task resolves every command it accepts; a dropped sender
        // means the task is gone.
        reply_rx.await.map_err(|_| Error::ConnectionLost)?
    }
}

/// Handle to a running IO task.
pub(crate) struct SessionIo {
    sender: CommandSender,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionIo {
    pub(crate) fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Whether the IO task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the IO task, failing pending commands, and wait for it to exit.
    pub(crate) async fn shutdown(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .sender
            .tx
            .send(Request::Shutdown { reply: reply_tx })
            .await
            .is_ok();
        if sent {
            let _ = reply_rx.await;
        } else {
            self.cancel.cancel();
        }
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task for a freshly negotiated session.
///
/// `assembler` carries any bytes that arrived behind the greeting.
pub(crate) fn spawn_io_task(
    transport: Box<dyn Transport>,
    assembler: FrameAssembler,
    dispatcher: Dispatcher,
    state: StateCell,
    queue_capacity: usize,
) -> SessionIo {
    let (tx, rx) = mpsc::channel::<Request>(queue_capacity.max(1));
    let cancel = CancellationToken::new();

    let task = tokio::spawn(io_loop(
        transport,
        assembler,
        dispatcher,
        state,
        rx,
        cancel.clone(),
    ));

    SessionIo {
        sender: CommandSender { tx },
        cancel,
        task,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Why the IO loop stopped.
enum Exit {
    /// The transport failed or the stream desynchronized.
    Failed(Error),
    /// Orderly shutdown requested by the connection handle.
    Shutdown(Option<oneshot::Sender<()>>),
}

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Each iteration first transmits the head of the queue if the line is idle,
/// then waits on, in priority order:
/// 1. Cancellation
/// 2. New requests
/// 3. The in-flight command's deadline
/// 4. Bytes from the device
async fn io_loop(
    mut transport: Box<dyn Transport>,
    mut assembler: FrameAssembler,
    mut dispatcher: Dispatcher,
    state: StateCell,
    mut rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    let mut recv_buf = [0u8; RECV_BUF_LEN];

    let exit = 'run: loop {
        if let Some(frame) = dispatcher.start_next(Instant::now()) {
            if let Err(e) = transport.send(&frame).await {
                break 'run Exit::Failed(e);
            }
        }
        state.set(if dispatcher.is_busy() {
            ConnectionState::AwaitingResponse
        } else {
            ConnectionState::Ready
        });

        let deadline = dispatcher.deadline();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                break 'run Exit::Shutdown(None);
            }

            req = rx.recv() => {
                match req {
                    Some(Request::Command(command)) => dispatcher.enqueue(command),
                    Some(Request::Shutdown { reply }) => {
                        debug!("IO task shutdown requested");
                        break 'run Exit::Shutdown(Some(reply));
                    }
                    None => {
                        debug!("request channel closed, exiting IO task");
                        break 'run Exit::Shutdown(None);
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                dispatcher.expire(Instant::now());
            }

            result = transport.receive(&mut recv_buf, RECEIVE_POLL) => {
                match result {
                    Ok(n) => {
                        for frame in assembler.feed(&recv_buf[..n]) {
                            if !frame.is_empty() {
                                state.emit(ConnectionEvent::FrameReceived(frame.to_text()));
                            }
                            match dispatcher.on_frame(frame) {
                                Ok(()) => {}
                                Err(e) if e.is_fatal() => break 'run Exit::Failed(e),
                                Err(e) => warn!(error = %e, "discarding frame"),
                            }
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(e) => break 'run Exit::Failed(e),
                }
            }
        }
    };

    rx.close();
    let reply = match exit {
        Exit::Failed(e) => {
            error!(error = %e, "connection failed");
            state.set(ConnectionState::Disconnected);
            dispatcher.fail_all(|| Error::ConnectionLost);
            None
        }
        Exit::Shutdown(reply) => {
            state.set(ConnectionState::Disconnected);
            dispatcher.fail_all(|| Error::Transport("connection closed by client".into()));
            reply
        }
    };

    // Requests that raced the exit are failed too rather than dropped.
    while let Ok(req) = rx.try_recv() {
        match req {
            Request::Command(command) => dispatcher.enqueue(command),
            Request::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
    dispatcher.fail_all(|| Error::NotConnected);

    if let Err(e) = transport.close().await {
        debug!(error = %e, "error closing transport");
    }
    state.emit(ConnectionEvent::Disconnected);

    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_REPLY_PREFIX_LEN;
    use crate::session::Session;
    use ntcontrol_test_harness::MockTransport;

    fn spawn(mock: MockTransport) -> (SessionIo, StateCell) {
        let state = StateCell::new();
        state.set(ConnectionState::Ready);
        let io = spawn_io_task(
            Box::new(mock),
            FrameAssembler::new(),
            Dispatcher::new(Session::open(), DEFAULT_REPLY_PREFIX_LEN),
            state.clone(),
            32,
        );
        (io, state)
    }

    #[tokio::test]
    async fn command_round_trip() {
        let mut mock = MockTransport::new();
        mock.expect(b"0000PON\r", b"00PON\r");
        let (io, state) = spawn(mock);

        let reply = io.sender().command("PON", Some(Duration::from_secs(1))).await;
        assert_eq!(reply.unwrap(), "PON");
        assert_eq!(state.get(), ConnectionState::Ready);
        io.shutdown().await;
    }

    #[tokio::test]
    async fn replies_split_across_reads() {
        let mut mock = MockTransport::new();
        mock.expect(b"0000QIN\r", b"00RG1\r");
        mock.set_chunk_size(2);
        let log = mock.log();
        let (io, _state) = spawn(mock);

        let reply = io.sender().command("QIN", Some(Duration::from_secs(1))).await;
        assert_eq!(reply.unwrap(), "RG1");
        assert_eq!(log.sent(), vec![b"0000QIN\r".to_vec()]);
        io.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_pending_and_emits_disconnected() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"0000QPW\r");
        let (io, state) = spawn(mock);
        let mut events = state.subscribe();

        let sender = io.sender();
        let pending = tokio::spawn(async move { sender.command("QPW", None).await });
        // Let the command reach the wire.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.get(), ConnectionState::AwaitingResponse);

        io.shutdown().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(state.get(), ConnectionState::Disconnected);

        let mut saw_disconnected = false;
        while let Ok(event) = events.try_recv() {
            if event == ConnectionEvent::Disconnected {
                saw_disconnected = true;
            }
        }
        assert!(saw_disconnected);
    }

    #[tokio::test]
    async fn transport_loss_ends_task() {
        let mut mock = MockTransport::new();
        mock.expect_disconnect(b"0000PON\r");
        let (io, state) = spawn(mock);

        let err = io
            .sender()
            .command("PON", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(state.get(), ConnectionState::Disconnected);

        // The task is gone; new commands are refused.
        let err = io.sender().command("POF", None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected | Error::ConnectionLost));
    }

    #[tokio::test]
    async fn frames_are_published() {
        let mut mock = MockTransport::new();
        mock.expect(b"0000PON\r", b"00PON\r");
        let (io, state) = spawn(mock);
        let mut events = state.subscribe();

        io.sender().command("PON", None).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::FrameReceived(text) = event {
                frames.push(text);
            }
        }
        assert_eq!(frames, vec!["00PON".to_string()]);
        io.shutdown().await;
    }
}
