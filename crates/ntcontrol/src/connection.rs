//! Connection -- the public handle to one NTCONTROL device.
//!
//! A [`Connection`] is created unconnected by
//! [`ConnectionBuilder`](crate::ConnectionBuilder). [`connect`](Connection::connect)
//! opens the TCP socket, reads the greeting, derives the session token, and
//! starts the IO task; from then on [`send_command`](Connection::send_command)
//! may be called concurrently from any number of tasks. Commands are sent to
//! the device strictly one at a time in submission order.
//!
//! The handle is reusable: after a disconnect, whether requested or caused by
//! a transport failure, `connect` may be called again and performs a fresh
//! handshake. [`connect_to`](Connection::connect_to) moves the same handle,
//! with its subscribers, to a different device.
//! [`destroy`](Connection::destroy) ends the lifecycle for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ntcontrol_core::error::{Error, Result};
use ntcontrol_core::events::{ConnectionEvent, ConnectionState};
use ntcontrol_core::transport::Transport;
use ntcontrol_transport::TcpTransport;

use crate::builder::ConnectionOptions;
use crate::dispatcher::Dispatcher;
use crate::io::{self, SessionIo};
use crate::protocol::{self, Frame, FrameAssembler};
use crate::session::{Credentials, Session};
use crate::state::StateCell;

/// Handle to an NTCONTROL device.
///
/// Safe to share across tasks behind an `Arc`.
pub struct Connection {
    options: ConnectionOptions,
    endpoint: RwLock<Endpoint>,
    credentials: Mutex<Option<Credentials>>,
    /// IO task of the current session. Also serializes connect/disconnect.
    io: Mutex<Option<SessionIo>>,
    protected: AtomicBool,
    state: StateCell,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: Option<String>,
    port: u16,
}

impl Connection {
    /// Create an unconnected handle. Prefer
    /// [`ConnectionBuilder`](crate::ConnectionBuilder), which validates the
    /// options.
    pub fn new(options: ConnectionOptions) -> Self {
        let credentials = options.credentials.clone();
        let endpoint = Endpoint {
            host: options.host.clone(),
            port: options.port,
        };
        Connection {
            options,
            endpoint: RwLock::new(endpoint),
            credentials: Mutex::new(credentials),
            io: Mutex::new(None),
            protected: AtomicBool::new(false),
            state: StateCell::new(),
        }
    }

    /// The options this connection was built with.
    ///
    /// `host` and `port` here are the build-time values; see
    /// [`addr`](Self::addr) for the current device.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// `host:port` of the current device, if a host is set.
    pub fn addr(&self) -> Option<String> {
        let endpoint = self.endpoint();
        endpoint
            .host
            .map(|host| format!("{}:{}", host, endpoint.port))
    }

    /// Replace the credentials used by the next handshake.
    ///
    /// An established session keeps the token it was created with.
    pub async fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        *self.credentials.lock().await = Some(Credentials::new(username, password));
    }

    /// Forget any stored credentials.
    pub async fn clear_credentials(&self) {
        *self.credentials.lock().await = None;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open a TCP connection to the current host and perform the
    /// handshake.
    ///
    /// Any existing session is torn down first. On failure the connection
    /// is left `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        self.ensure_open()?;
        let endpoint = self.endpoint();
        let host = endpoint
            .host
            .ok_or_else(|| Error::InvalidParameter("no host configured".into()))?;
        self.open_tcp(&mut io, &host, endpoint.port).await
    }

    /// Point the handle at `host:port` and connect there.
    ///
    /// The current session, if any, is closed first. Subscribers, state
    /// callbacks and monitors attached to this handle keep working, and
    /// later calls to [`connect`](Self::connect) reuse the new address.
    pub async fn connect_to(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::InvalidParameter("host must not be empty".into()));
        }
        if port == 0 {
            return Err(Error::InvalidParameter("port must be non-zero".into()));
        }

        let mut io = self.io.lock().await;
        self.ensure_open()?;
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Endpoint {
            host: Some(host.clone()),
            port,
        };
        self.open_tcp(&mut io, &host, port).await
    }

    /// Perform the handshake over an already-open transport.
    ///
    /// Used for transports other than plain TCP and for tests.
    pub async fn connect_with_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut io = self.io.lock().await;
        self.ensure_open()?;
        self.teardown(&mut io).await;

        self.state.set(ConnectionState::Connecting);
        self.establish(&mut io, transport).await
    }

    /// Close the current session.
    ///
    /// Every queued or in-flight command fails with [`Error::Transport`].
    /// The handle may be connected again afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        self.teardown(&mut io).await;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }

    /// Disconnect and move to the terminal `Closed` state.
    ///
    /// Later calls to `connect` or `send_command` fail with
    /// [`Error::Closed`].
    pub async fn destroy(&self) {
        let mut io = self.io.lock().await;
        self.teardown(&mut io).await;
        self.state.set(ConnectionState::Disconnected);
        self.state.set(ConnectionState::Closed);
        debug!("connection destroyed");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Send a command body (e.g. `"QPW"`) and return the reply payload,
    /// using the configured command timeout.
    pub async fn send_command(&self, body: &str) -> Result<String> {
        self.send_command_with_timeout(body, self.options.command_timeout)
            .await
    }

    /// Send a command with an explicit reply timeout.
    ///
    /// The timeout runs from transmission, not from submission, so time
    /// spent queued behind other commands does not count against it.
    ///
    /// Replies carry no request identifier. If the device answers a command
    /// after it has timed out, that late reply is taken as the answer to the
    /// next command and later replies stay shifted by one. After a timeout,
    /// treat following replies as suspect, or reconnect to resynchronize.
    ///
    /// Fails immediately with [`Error::NotConnected`] unless the connection
    /// is ready, or [`Error::Closed`] after [`destroy`](Self::destroy).
    pub async fn send_command_with_timeout(
        &self,
        body: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.ensure_open()?;
        protocol::validate_body(body)?;
        if !self.state.get().is_ready() {
            return Err(Error::NotConnected);
        }

        let sender = {
            let io = self.io.lock().await;
            match io.as_ref() {
                Some(io) if !io.is_finished() => io.sender(),
                _ => return Err(Error::NotConnected),
            }
        };
        sender.command(body, timeout).await
    }

    // -----------------------------------------------------------------------
    // State and events
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether commands are currently accepted.
    pub fn is_ready(&self) -> bool {
        self.state.get().is_ready()
    }

    /// Whether the current session authenticated with a token.
    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state.subscribe()
    }

    /// A receiver that always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    /// Invoke `callback` for every state transition from now on.
    ///
    /// The callback runs on a spawned task, which ends after the `Closed`
    /// transition or when the connection is dropped. Abort the returned
    /// handle to stop listening early.
    pub fn on_state_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ConnectionState) + Send + 'static,
    {
        let mut rx = self.state.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConnectionEvent::StateChanged(state)) => {
                        callback(state);
                        if state == ConnectionState::Closed {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "state listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open_tcp(&self, io: &mut Option<SessionIo>, host: &str, port: u16) -> Result<()> {
        self.teardown(io).await;

        self.state.set(ConnectionState::Connecting);
        let transport =
            match TcpTransport::connect_with_timeout(host, port, self.options.connect_timeout)
                .await
            {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(host = %host, port, error = %e, "connect failed");
                    self.state.set(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

        self.establish(io, Box::new(transport)).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.get() == ConnectionState::Closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Stop the current IO task, if any.
    async fn teardown(&self, io: &mut Option<SessionIo>) {
        if let Some(session_io) = io.take() {
            info!("closing session");
            session_io.shutdown().await;
        }
        self.protected.store(false, Ordering::SeqCst);
    }

    /// Read the greeting, derive the session, and start the IO task.
    async fn establish(
        &self,
        io: &mut Option<SessionIo>,
        mut transport: Box<dyn Transport>,
    ) -> Result<()> {
        self.state.set(ConnectionState::AwaitingGreeting);

        let mut assembler = FrameAssembler::new();
        let credentials = self.credentials.lock().await.clone();
        let session = match read_greeting(
            &mut *transport,
            &mut assembler,
            self.options.greeting_timeout,
        )
        .await
        .and_then(|frame| protocol::parse_greeting(&frame))
        .and_then(|greeting| Session::establish(greeting, credentials.as_ref()))
        {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "handshake failed");
                let _ = transport.close().await;
                self.state.set(ConnectionState::Disconnected);
                self.state.emit(ConnectionEvent::Disconnected);
                return Err(e);
            }
        };

        let protected = session.is_protected();
        info!(protected, "connected");
        self.protected.store(protected, Ordering::SeqCst);
        self.state
            .emit(ConnectionEvent::HandshakeComplete { protected });

        // Ready before the task starts, so a failure inside the task can
        // only move the state forward to Disconnected.
        self.state.set(ConnectionState::Ready);
        self.state.emit(ConnectionEvent::Connected);

        let dispatcher = Dispatcher::new(session, self.options.reply_prefix_len);
        *io = Some(io::spawn_io_task(
            transport,
            assembler,
            dispatcher,
            self.state.clone(),
            self.options.queue_capacity,
        ));
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

/// Read until the first complete frame arrives or `timeout` elapses.
///
/// Any bytes after that frame stay in `assembler`.
async fn read_greeting(
    transport: &mut dyn Transport,
    assembler: &mut FrameAssembler,
    timeout: Duration,
) -> Result<Frame> {
    let mut buf = [0u8; 256];
    let read = async {
        loop {
            let n = match transport.receive(&mut buf, timeout).await {
                Ok(n) => n,
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            };
            let mut frames = assembler.feed(&buf[..n]).into_iter();
            if let Some(greeting) = frames.next() {
                for extra in frames {
                    warn!(frame = %extra.to_text(), "discarding frame received with greeting");
                }
                return Ok(greeting);
            }
        }
    };

    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}
