//! NTCONTROL wire format: framing, greeting, command encoding, reply decoding.
//!
//! Every message in both directions is ASCII text terminated by a carriage
//! return. The first frame on a connection is an unsolicited greeting that
//! announces the authentication mode:
//!
//! ```text
//! NTCONTROL 0\r               open mode, no token
//! NTCONTROL 1 <nonce:8>\r     protected mode, token = md5(user:pass:nonce)
//! ```
//!
//! After the greeting, each command frame is
//!
//! ```text
//! [token: 32 hex chars, or "00" in open mode]00<body>\r
//! ```
//!
//! and the device answers with one frame per command: a two-byte class
//! prefix followed by the payload, or the literal error frame `00ERRA\r`.

use bytes::{BufMut, Bytes, BytesMut};

use ntcontrol_core::error::{Error, Result};

/// The carriage return byte that terminates every frame.
pub const TERMINATOR: u8 = b'\r';

/// Greeting sent by a device that does not require authentication.
pub const OPEN_GREETING: &[u8] = b"NTCONTROL 0";

/// Leading bytes of the greeting sent by a device that requires a token.
pub const PROTECTED_GREETING_PREFIX: &[u8] = b"NTCONTROL 1 ";

/// Width of the nonce that follows [`PROTECTED_GREETING_PREFIX`].
pub const NONCE_LEN: usize = 8;

/// Class marker placed between the token and the command body.
pub const CLASS_MARKER: &[u8] = b"00";

/// Occupies the token position when the session has no token.
pub const OPEN_MODE_TOKEN: &[u8] = b"00";

/// The device's canonical error reply (terminator stripped).
pub const ERROR_FRAME: &[u8] = b"00ERRA";

/// Default width of the prefix that precedes a reply payload.
///
/// Together with the terminator this makes a three-byte envelope around
/// every payload.
pub const DEFAULT_REPLY_PREFIX_LEN: usize = 2;

/// Largest partial frame kept while waiting for a terminator.
///
/// Real frames are a few dozen bytes; anything past this is line noise.
pub const MAX_FRAME_LEN: usize = 8192;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One terminator-delimited unit of the byte stream, terminator excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Build a frame from raw bytes (which must not contain the terminator).
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Frame(Bytes::from_static(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The frame as text, with invalid UTF-8 replaced.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Splits an incoming byte stream into [`Frame`]s.
///
/// Bytes are appended to an internal buffer; every complete frame is yielded
/// in arrival order and the trailing partial frame is retained for the next
/// call. Chunk boundaries never affect the result.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every frame it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == TERMINATOR) {
            let mut frame = self.buf.split_to(pos + 1);
            frame.truncate(pos);
            frames.push(Frame(frame.freeze()));
        }

        if self.buf.len() > MAX_FRAME_LEN {
            tracing::warn!(
                len = self.buf.len(),
                "partial frame exceeds maximum length, discarding"
            );
            self.buf.clear();
        }

        frames
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ---------------------------------------------------------------------------
// Greeting
// ---------------------------------------------------------------------------

/// Authentication mode announced by the device greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    /// No authentication; commands carry an empty token.
    Open,
    /// Commands must carry a token derived from this nonce.
    Protected {
        /// The server-chosen nonce (always [`NONCE_LEN`] bytes).
        nonce: Bytes,
    },
}

impl Greeting {
    pub fn is_protected(&self) -> bool {
        matches!(self, Greeting::Protected { .. })
    }
}

/// Interpret the first frame received on a connection.
///
/// Both greetings are matched on their fixed-length prefix. Returns
/// [`Error::Protocol`] for anything else. Bytes after the open greeting or
/// after the nonce are ignored.
pub fn parse_greeting(frame: &Frame) -> Result<Greeting> {
    let bytes = frame.as_bytes();

    if let Some(trailing) = bytes.strip_prefix(OPEN_GREETING) {
        if !trailing.is_empty() {
            tracing::debug!(
                trailing = %String::from_utf8_lossy(trailing),
                "ignoring bytes after open greeting"
            );
        }
        return Ok(Greeting::Open);
    }

    if let Some(rest) = bytes.strip_prefix(PROTECTED_GREETING_PREFIX) {
        if rest.len() < NONCE_LEN {
            return Err(Error::Protocol(format!(
                "protected greeting nonce too short: {:?}",
                frame.to_text()
            )));
        }
        let (nonce, trailing) = rest.split_at(NONCE_LEN);
        if !trailing.is_empty() {
            tracing::debug!(
                trailing = %String::from_utf8_lossy(trailing),
                "ignoring bytes after greeting nonce"
            );
        }
        return Ok(Greeting::Protected {
            nonce: Bytes::copy_from_slice(nonce),
        });
    }

    Err(Error::Protocol(format!(
        "unexpected greeting: {:?}",
        frame.to_text()
    )))
}

// ---------------------------------------------------------------------------
// Commands and replies
// ---------------------------------------------------------------------------

/// Check that a command body can be framed.
///
/// A body containing the terminator would be split into two frames by the
/// device and desynchronize every later reply.
pub fn validate_body(body: &str) -> Result<()> {
    if body.as_bytes().contains(&TERMINATOR) {
        return Err(Error::InvalidParameter(format!(
            "command body contains a carriage return: {:?}",
            body
        )));
    }
    Ok(())
}

/// Encode a command frame: `token ++ "00" ++ body ++ CR`.
///
/// `token` is empty in open mode, where [`OPEN_MODE_TOKEN`] takes its place.
///
/// # Example
///
/// ```
/// use ntcontrol::protocol::encode_command;
///
/// assert_eq!(&encode_command("", "PON").unwrap()[..], b"0000PON\r");
/// ```
pub fn encode_command(token: &str, body: &str) -> Result<Bytes> {
    validate_body(body)?;

    let token = if token.is_empty() {
        OPEN_MODE_TOKEN
    } else {
        token.as_bytes()
    };
    let capacity = token.len() + CLASS_MARKER.len() + body.len() + 1;
    let mut buf = BytesMut::with_capacity(capacity);
    buf.put_slice(token);
    buf.put_slice(CLASS_MARKER);
    buf.put_slice(body.as_bytes());
    buf.put_u8(TERMINATOR);
    Ok(buf.freeze())
}

/// Result of classifying a reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Any frame other than the error literal, unchanged.
    Normal(Frame),
    /// The device's canonical error frame.
    DeviceError,
}

/// Exact match against [`ERROR_FRAME`].
pub fn classify(frame: Frame) -> Classified {
    if frame.as_bytes() == ERROR_FRAME {
        Classified::DeviceError
    } else {
        Classified::Normal(frame)
    }
}

/// Extract the payload of a normal reply: everything after `prefix_len`
/// bytes.
///
/// A frame shorter than the prefix means the stream is out of step and is
/// reported as [`Error::Protocol`].
pub fn reply_payload(frame: &Frame, prefix_len: usize) -> Result<String> {
    let bytes = frame.as_bytes();
    match bytes.get(prefix_len..) {
        Some(payload) => Ok(String::from_utf8_lossy(payload).into_owned()),
        None => Err(Error::Protocol(format!(
            "reply {:?} shorter than {}-byte prefix",
            frame.to_text(),
            prefix_len
        ))),
    }
}
