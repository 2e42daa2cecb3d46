//! Authentication state for one established connection.

use std::fmt;

use md5::{Digest, Md5};

use ntcontrol_core::error::{Error, Result};

use crate::protocol::Greeting;

/// Username and password used to answer a protected greeting.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Compute the protected-mode token: lowercase hex of
/// `md5(username ":" password ":" nonce)`.
///
/// Always 32 characters. Fields are joined verbatim, so a colon inside a
/// username or password is not escaped. The nonce is hashed as raw bytes.
///
/// ```
/// use ntcontrol::session::digest;
///
/// assert_eq!(
///     digest("admin1", "panasonic", "ABCDEFGH"),
///     "0a691c2a19d0ac64c28293b566414da4"
/// );
/// ```
pub fn digest(username: &str, password: &str, nonce: impl AsRef<[u8]>) -> String {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.as_ref());
    format!("{:x}", hasher.finalize())
}

/// The outcome of a successful handshake.
///
/// A session lives exactly as long as its TCP connection. Reconnecting
/// produces a fresh greeting and therefore a fresh session; a token is never
/// reused across connections.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    greeting: Greeting,
    token: String,
}

impl Session {
    /// A session for a device in open mode.
    pub fn open() -> Self {
        Session {
            greeting: Greeting::Open,
            token: String::new(),
        }
    }

    /// Derive the session for `greeting`.
    ///
    /// A protected greeting requires `credentials`; without them the device
    /// would reject every command, so the handshake fails with
    /// [`Error::Protocol`].
    pub fn establish(greeting: Greeting, credentials: Option<&Credentials>) -> Result<Self> {
        match &greeting {
            Greeting::Open => Ok(Session {
                greeting,
                token: String::new(),
            }),
            Greeting::Protected { nonce } => {
                let creds = credentials.ok_or_else(|| {
                    Error::Protocol(
                        "device requires authentication but no credentials are set".into(),
                    )
                })?;
                let token = digest(&creds.username, &creds.password, nonce);
                Ok(Session { greeting, token })
            }
        }
    }

    /// Token prepended to every command; empty in open mode.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_protected(&self) -> bool {
        self.greeting.is_protected()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("protected", &self.is_protected())
            .finish_non_exhaustive()
    }
}
