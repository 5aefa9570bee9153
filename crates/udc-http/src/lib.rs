//! HTTP and HTTPS backend for the URL data cache.
//!
//! Resource metadata comes from `HEAD` (falling back to a one-byte ranged `GET` for servers
//! that reject `HEAD` or omit `Content-Length`), and data from exact byte-range `GET`s.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use udc_core::{RemoteInfo, RemoteSource, UdcError, UdcErrorKind, UdcResult};
use url::Url;

mod native;

pub use native::Client;

/// Redirects followed while probing metadata.
pub const INFO_MAX_REDIRECTS: usize = 5;
/// Redirects followed for ranged data requests.
pub const DATA_MAX_REDIRECTS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("{0}")]
    Msg(String),
    #[error("{op}: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl From<HttpError> for UdcError {
    fn from(err: HttpError) -> Self {
        UdcError::with_message(UdcErrorKind::Remote, err.to_string())
    }
}

/// Timeouts applied to every request issued by [`HttpSource`].
#[derive(Clone, Copy, Debug)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// [`RemoteSource`] for `http://` and `https://` URLs.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    scheme: &'static str,
}

impl HttpSource {
    pub fn new() -> UdcResult<Self> {
        Self::with_config(HttpConfig::default())
    }

    pub fn with_config(config: HttpConfig) -> UdcResult<Self> {
        Ok(Self {
            client: Client::new(config)?,
            scheme: "http",
        })
    }

    /// Same client, reporting itself as the `https` backend.
    pub fn https(config: HttpConfig) -> UdcResult<Self> {
        Ok(Self {
            scheme: "https",
            ..Self::with_config(config)?
        })
    }
}

fn parse_http_url(url: &str) -> UdcResult<Url> {
    let parsed = Url::parse(url).map_err(|err| {
        UdcError::with_message(UdcErrorKind::InvalidInput, format!("parse URL {url}: {err}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("unsupported scheme '{other}' for HTTP backend: {url}"),
        )),
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &'static str {
        self.scheme
    }

    async fn fetch_info(&self, url: &str) -> UdcResult<Option<RemoteInfo>> {
        let parsed = parse_http_url(url)?;
        let info = self.client.fetch_info(&parsed).await?;
        debug!(%url, ?info, "http remote info");
        Ok(info)
    }

    async fn fetch_data(&self, url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let parsed = parse_http_url(url)?;
        let end = offset
            .checked_add(buf.len() as u64 - 1)
            .ok_or_else(|| UdcError::with_message(UdcErrorKind::InvalidInput, "range overflow"))?;
        Ok(self.client.read_range(&parsed, offset..=end, buf).await?)
    }
}
