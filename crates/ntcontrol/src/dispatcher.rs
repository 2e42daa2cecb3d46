//! Command queue and reply correlation.
//!
//! NTCONTROL replies carry no request identifier, so the only way to pair a
//! reply with its command is strict ordering: at most one command is on the
//! wire at a time and the next frame from the device belongs to it. The
//! [`Dispatcher`] owns that invariant. It is plain synchronous state driven by
//! the IO task, which does the actual sending and receiving.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use ntcontrol_core::error::{Error, Result};

use crate::protocol::{self, Classified, ERROR_FRAME, Frame};
use crate::session::Session;

/// A command waiting for, or awaiting, its reply.
#[derive(Debug)]
pub struct PendingCommand {
    body: String,
    timeout: Option<Duration>,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<String>>,
}

impl PendingCommand {
    /// `timeout` runs from the moment the command is transmitted; `None`
    /// waits indefinitely.
    pub fn new(
        body: impl Into<String>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<String>>,
    ) -> Self {
        PendingCommand {
            body: body.into(),
            timeout,
            enqueued_at: Instant::now(),
            reply,
        }
    }

    /// Whether the caller has stopped waiting for the result.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn resolve(self, result: Result<String>) {
        // The caller may have given up; nothing to do then.
        let _ = self.reply.send(result);
    }
}

#[derive(Debug)]
struct InFlight {
    command: PendingCommand,
    sent_at: Instant,
    deadline: Option<Instant>,
}

/// FIFO of pending commands with at most one in flight.
#[derive(Debug)]
pub struct Dispatcher {
    session: Session,
    reply_prefix_len: usize,
    queue: VecDeque<PendingCommand>,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    pub fn new(session: Session, reply_prefix_len: usize) -> Self {
        Dispatcher {
            session,
            reply_prefix_len,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Append a command to the tail of the queue.
    pub fn enqueue(&mut self, command: PendingCommand) {
        debug!(command = %command.body, queued = self.queue.len(), "command enqueued");
        self.queue.push_back(command);
    }

    /// Whether a command is on the wire.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of commands waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// When the in-flight command times out, if it has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().and_then(|f| f.deadline)
    }

    /// Take the next live command off the queue, mark it in flight, and
    /// return the bytes to transmit.
    ///
    /// Returns `None` when a command is already in flight or the queue is
    /// empty. Commands whose caller has gone away are dropped without being
    /// sent.
    pub fn start_next(&mut self, now: Instant) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }

        while let Some(command) = self.queue.pop_front() {
            if command.is_abandoned() {
                debug!(command = %command.body, "skipping abandoned command");
                continue;
            }

            let frame = match protocol::encode_command(self.session.token(), &command.body) {
                Ok(frame) => frame,
                Err(e) => {
                    command.resolve(Err(e));
                    continue;
                }
            };

            debug!(
                command = %command.body,
                waited_ms = now.saturating_duration_since(command.enqueued_at).as_millis() as u64,
                "transmitting command"
            );
            let deadline = command.timeout.map(|t| now + t);
            self.in_flight = Some(InFlight {
                command,
                sent_at: now,
                deadline,
            });
            return Some(frame);
        }

        None
    }

    /// Route a frame from the device to the in-flight command.
    ///
    /// Returns `Err` when the frame could not be delivered:
    ///
    /// - [`Error::QueueAnomaly`] if nothing was in flight. The frame is
    ///   discarded and the connection is still usable.
    /// - [`Error::Protocol`] if the reply was too short to carry a payload.
    ///   The in-flight command has already been failed and the stream can no
    ///   longer be trusted.
    pub fn on_frame(&mut self, frame: Frame) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let Some(in_flight) = self.in_flight.take() else {
            return Err(Error::QueueAnomaly(frame.to_text()));
        };
        let elapsed_ms = in_flight.sent_at.elapsed().as_millis() as u64;
        let command = in_flight.command;

        match protocol::classify(frame) {
            Classified::DeviceError => {
                debug!(command = %command.body, elapsed_ms, "device rejected command");
                let literal = String::from_utf8_lossy(ERROR_FRAME).into_owned();
                command.resolve(Err(Error::Device(literal)));
                Ok(())
            }
            Classified::Normal(frame) => {
                match protocol::reply_payload(&frame, self.reply_prefix_len) {
                    Ok(payload) => {
                        debug!(
                            command = %command.body,
                            reply = %payload,
                            elapsed_ms,
                            "command resolved"
                        );
                        command.resolve(Ok(payload));
                        Ok(())
                    }
                    Err(Error::Protocol(msg)) => {
                        command.resolve(Err(Error::Protocol(msg.clone())));
                        Err(Error::Protocol(msg))
                    }
                    Err(e) => {
                        command.resolve(Err(Error::Protocol(e.to_string())));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Fail the in-flight command with [`Error::Timeout`] if its deadline has
    /// passed.
    ///
    /// Returns `true` when a command was expired. The queue then advances on
    /// the next call to [`start_next`](Self::start_next).
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = matches!(self.deadline(), Some(deadline) if deadline <= now);
        if !expired {
            return false;
        }
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                command = %in_flight.command.body,
                timeout_ms = now.saturating_duration_since(in_flight.sent_at).as_millis() as u64,
                "command timed out"
            );
            in_flight.command.resolve(Err(Error::Timeout));
        }
        true
    }

    /// Fail the in-flight command and every queued command.
    ///
    /// `err` builds a fresh error for each one.
    pub fn fail_all(&mut self, err: impl Fn() -> Error) {
        let count = self.queue.len() + usize::from(self.in_flight.is_some());
        if count > 0 {
            debug!(count, "failing pending commands");
        }
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.command.resolve(Err(err()));
        }
        for command in self.queue.drain(..) {
            command.resolve(Err(err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEFAULT_REPLY_PREFIX_LEN, Greeting};
    use crate::session::Credentials;

    fn command(
        body: &str,
        timeout: Option<Duration>,
    ) -> (PendingCommand, oneshot::Receiver<Result<String>>) {
        let (tx, rx) = oneshot::channel();
        (PendingCommand::new(body, timeout, tx), rx)
    }

    fn open_dispatcher() -> Dispatcher {
        Dispatcher::new(Session::open(), DEFAULT_REPLY_PREFIX_LEN)
    }

    #[test]
    fn transmits_one_at_a_time_in_order() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("QPW", None);
        let (b, mut rb) = command("QIN", None);
        d.enqueue(a);
        d.enqueue(b);

        let now = Instant::now();
        assert_eq!(&d.start_next(now).unwrap()[..], b"0000QPW\r");
        assert!(d.is_busy());
        // Still waiting on QPW.
        assert!(d.start_next(now).is_none());

        d.on_frame(Frame::from_static(b"001")).unwrap();
        assert_eq!(ra.try_recv().unwrap().unwrap(), "1");
        assert!(rb.try_recv().is_err());

        assert_eq!(&d.start_next(now).unwrap()[..], b"0000QIN\r");
        d.on_frame(Frame::from_static(b"00RG1")).unwrap();
        assert_eq!(rb.try_recv().unwrap().unwrap(), "RG1");
        assert!(!d.is_busy());
        assert!(d.start_next(now).is_none());
    }

    #[test]
    fn uses_session_token() {
        let creds = Credentials::new("admin1", "panasonic");
        let greeting = Greeting::Protected {
            nonce: "ABCDEFGH".into(),
        };
        let session = Session::establish(greeting, Some(&creds)).unwrap();
        let mut d = Dispatcher::new(session, DEFAULT_REPLY_PREFIX_LEN);
        let (c, _rx) = command("POF", None);
        d.enqueue(c);
        assert_eq!(
            &d.start_next(Instant::now()).unwrap()[..],
            b"0a691c2a19d0ac64c28293b566414da400POF\r"
        );
    }

    #[test]
    fn error_frame_fails_only_the_head() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("XXX", None);
        let (b, mut rb) = command("PON", None);
        d.enqueue(a);
        d.enqueue(b);

        d.start_next(Instant::now());
        d.on_frame(Frame::from_static(b"00ERRA")).unwrap();
        assert!(matches!(
            ra.try_recv().unwrap(),
            Err(Error::Device(ref m)) if m == "00ERRA"
        ));

        d.start_next(Instant::now());
        d.on_frame(Frame::from_static(b"00PON")).unwrap();
        assert_eq!(rb.try_recv().unwrap().unwrap(), "PON");
    }

    #[test]
    fn unsolicited_frame_is_an_anomaly() {
        let mut d = open_dispatcher();
        let err = d.on_frame(Frame::from_static(b"00PON")).unwrap_err();
        assert!(matches!(err, Error::QueueAnomaly(ref m) if m == "00PON"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn empty_frame_is_ignored() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("PON", None);
        d.enqueue(a);
        d.start_next(Instant::now());

        d.on_frame(Frame::from_static(b"")).unwrap();
        assert!(d.is_busy());
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn short_reply_is_fatal() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("PON", None);
        d.enqueue(a);
        d.start_next(Instant::now());

        let err = d.on_frame(Frame::from_static(b"0")).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(ra.try_recv().unwrap(), Err(Error::Protocol(_))));
    }

    #[test]
    fn abandoned_commands_are_not_sent() {
        let mut d = open_dispatcher();
        let (a, ra) = command("PON", None);
        let (b, _rb) = command("POF", None);
        d.enqueue(a);
        d.enqueue(b);
        drop(ra);

        assert_eq!(&d.start_next(Instant::now()).unwrap()[..], b"0000POF\r");
        assert_eq!(d.queued(), 0);
    }

    #[test]
    fn invalid_body_fails_without_blocking_queue() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("P\rON", None);
        let (b, _rb) = command("POF", None);
        d.enqueue(a);
        d.enqueue(b);

        assert_eq!(&d.start_next(Instant::now()).unwrap()[..], b"0000POF\r");
        assert!(matches!(
            ra.try_recv().unwrap(),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn deadline_runs_from_transmission() {
        let mut d = open_dispatcher();
        let (a, _ra) = command("PON", Some(Duration::from_secs(2)));
        d.enqueue(a);
        assert_eq!(d.deadline(), None);

        let sent = Instant::now() + Duration::from_secs(10);
        d.start_next(sent);
        assert_eq!(d.deadline(), Some(sent + Duration::from_secs(2)));
    }

    #[test]
    fn expire_fails_in_flight_and_frees_the_line() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("QPW", Some(Duration::from_secs(2)));
        let (b, _rb) = command("PON", Some(Duration::from_secs(2)));
        d.enqueue(a);
        d.enqueue(b);

        let now = Instant::now();
        d.start_next(now);
        assert!(!d.expire(now + Duration::from_millis(1999)));
        assert!(d.is_busy());

        assert!(d.expire(now + Duration::from_secs(2)));
        assert!(matches!(ra.try_recv().unwrap(), Err(Error::Timeout)));
        assert!(!d.is_busy());
        assert_eq!(&d.start_next(now).unwrap()[..], b"0000PON\r");
    }

    #[test]
    fn no_timeout_never_expires() {
        let mut d = open_dispatcher();
        let (a, _ra) = command("QPW", None);
        d.enqueue(a);
        let now = Instant::now();
        d.start_next(now);
        assert!(!d.expire(now + Duration::from_secs(3600)));
        assert!(d.is_busy());
    }

    #[test]
    fn fail_all_resolves_everything_once() {
        let mut d = open_dispatcher();
        let (a, mut ra) = command("PON", None);
        let (b, mut rb) = command("POF", None);
        let (c, mut rc) = command("QPW", None);
        d.enqueue(a);
        d.enqueue(b);
        d.enqueue(c);
        d.start_next(Instant::now());

        d.fail_all(|| Error::ConnectionLost);
        for rx in [&mut ra, &mut rb, &mut rc] {
            assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionLost)));
        }
        assert!(!d.is_busy());
        assert_eq!(d.queued(), 0);
    }

    #[test]
    fn custom_reply_prefix_len() {
        let mut d = Dispatcher::new(Session::open(), 3);
        let (a, mut ra) = command("QPW", None);
        d.enqueue(a);
        d.start_next(Instant::now());
        d.on_frame(Frame::from_static(b"0001")).unwrap();
        assert_eq!(ra.try_recv().unwrap().unwrap(), "1");
    }
}
