//! Shared building blocks for the URL data cache.
//!
//! This crate holds the pieces every other udc crate agrees on: the error model, the
//! [`RemoteSource`] backend trait implemented once per protocol, and the MSB-first bit
//! vector helpers used by the on-disk bitmap.

use async_trait::async_trait;

pub mod bits;

/// Result alias used across the udc crates.
pub type UdcResult<T> = Result<T, UdcError>;

/// Coarse classification of a [`UdcError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UdcErrorKind {
    #[error("invalid input")]
    InvalidInput,
    #[error("I/O error")]
    Io,
    #[error("remote fetch failed")]
    Remote,
    #[error("corrupt cache metadata")]
    Corrupt,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("resource too large")]
    TooLarge,
    #[error("unsupported")]
    Unsupported,
}

/// Error type shared by the cache core and every protocol backend.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct UdcError {
    kind: UdcErrorKind,
    message: String,
}

impl UdcError {
    pub fn with_message(kind: UdcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> UdcErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for UdcError {
    fn from(err: std::io::Error) -> Self {
        io_err("i/o", err)
    }
}

/// Wrap a filesystem error with the operation that produced it.
pub fn io_err(op: &str, err: std::io::Error) -> UdcError {
    UdcError::with_message(UdcErrorKind::Io, format!("{op}: {err}"))
}

/// Size and modification time of a remote resource, as reported by its backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Length in bytes.
    pub size: u64,
    /// Last modification, in seconds since the Unix epoch.
    pub update_time: u64,
}

impl RemoteInfo {
    pub fn new(size: u64, update_time: u64) -> Self {
        Self { size, update_time }
    }
}

/// Protocol backend: one implementation per URL scheme.
///
/// `fetch_info` reports a missing resource as `Ok(None)` so callers can treat "not found"
/// as an ordinary outcome. `fetch_data` either fills the caller's buffer or fails; a short
/// count is only legitimate at the end of the resource.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Short protocol name used in logs and statistics (`"http"`, `"local"`, ...).
    fn name(&self) -> &'static str;

    /// Look up size and modification time of `url`.
    async fn fetch_info(&self, url: &str) -> UdcResult<Option<RemoteInfo>>;

    /// Read `buf.len()` bytes of `url` starting at `offset`. Returns the number of bytes read.
    async fn fetch_data(&self, url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize>;
}
