use std::fmt;
use std::sync::Arc;

use udc_core::{RemoteSource, UdcError, UdcErrorKind, UdcResult};
use udc_ftp::FtpSource;
use udc_http::{HttpConfig, HttpSource};

use crate::config::UdcConfig;
use crate::local::{LocalSource, SlowSource};
use crate::path;

/// How a URL is read, decided once when a handle is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// No scheme: the path is a local file read in place, without caching.
    Transparent,
    Local,
    Slow,
    Http,
    Https,
    Ftp,
}

impl Protocol {
    pub fn from_url(url: &str) -> UdcResult<Self> {
        let Some(scheme) = path::scheme(url) else {
            return Ok(Self::Transparent);
        };
        match scheme {
            "local" => Ok(Self::Local),
            "slow" => Ok(Self::Slow),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "ftp" => Ok(Self::Ftp),
            other => Err(UdcError::with_message(
                UdcErrorKind::Unsupported,
                format!("unsupported protocol '{other}' in {url}"),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Transparent => "transparent",
            Self::Local => "local",
            Self::Slow => "slow",
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
        }
    }

    /// Backend serving this protocol. Transparent paths have none.
    pub fn source(self, config: &UdcConfig) -> UdcResult<Option<Arc<dyn RemoteSource>>> {
        let http = HttpConfig {
            connect_timeout: config.http_connect_timeout,
            timeout: config.http_timeout,
        };
        let source: Arc<dyn RemoteSource> = match self {
            Self::Transparent => return Ok(None),
            Self::Local => Arc::new(LocalSource),
            Self::Slow => Arc::new(SlowSource::new(config.slow_delays)),
            Self::Http => Arc::new(HttpSource::with_config(http)?),
            Self::Https => Arc::new(HttpSource::https(http)?),
            Self::Ftp => Arc::new(FtpSource::new(config.ftp_timeout)),
        };
        Ok(Some(source))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
