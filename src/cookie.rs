//! Session cookie binding a data connection to its control connection.
//!
//! The cookie is 36 characters drawn from a 32-symbol alphabet followed by a
//! NUL byte, 37 bytes in total. The client generates it once, sends it on the
//! control connection right after connecting, and sends it again as the first
//! bytes of the TCP data connection so the server can match the two.

use crate::{Error, Result};
use rand::Rng;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a cookie on the wire, terminator included.
pub const COOKIE_SIZE: usize = 37;

/// Symbols a cookie is drawn from.
pub const COOKIE_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A 37-byte session token.
///
/// # Examples
///
/// ```
/// use nperf3::cookie::{Cookie, COOKIE_SIZE};
///
/// let cookie = Cookie::generate();
/// assert_eq!(cookie.as_bytes().len(), COOKIE_SIZE);
/// assert_eq!(cookie.as_bytes()[COOKIE_SIZE - 1], 0);
///
/// let parsed = Cookie::from_bytes(cookie.as_bytes()).unwrap();
/// assert_eq!(parsed, cookie);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    /// Generates a fresh random cookie.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; COOKIE_SIZE];
        for b in bytes.iter_mut().take(COOKIE_SIZE - 1) {
            *b = COOKIE_ALPHABET[(rng.gen::<u8>() & 31) as usize];
        }
        Self(bytes)
    }

    /// Validates raw wire bytes as a cookie.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the length is not 37, the last byte is not
    /// NUL, or any other byte falls outside the alphabet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; COOKIE_SIZE] = bytes.try_into().map_err(|_| {
            Error::protocol(format!(
                "cookie must be {} bytes, got {}",
                COOKIE_SIZE,
                bytes.len()
            ))
        })?;

        if bytes[COOKIE_SIZE - 1] != 0 {
            return Err(Error::protocol("cookie is not NUL-terminated"));
        }
        if let Some(bad) = bytes[..COOKIE_SIZE - 1]
            .iter()
            .find(|&&b| !COOKIE_ALPHABET.contains(&b))
        {
            return Err(Error::protocol(format!(
                "cookie contains invalid byte 0x{:02x}",
                bad
            )));
        }

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }

    /// The 36 printable characters.
    pub fn as_str(&self) -> &str {
        // Every byte before the terminator is ASCII by construction.
        std::str::from_utf8(&self.0[..COOKIE_SIZE - 1]).unwrap_or_default()
    }

    /// Reads exactly one cookie from `reader` and validates it.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; COOKIE_SIZE];
        reader.read_exact(&mut bytes).await?;
        Self::from_bytes(&bytes)
    }

    /// Writes the cookie, terminator included.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.0).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", self.as_str())
    }
}
