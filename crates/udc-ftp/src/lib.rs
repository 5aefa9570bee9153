//! FTP backend for the URL data cache.
//!
//! Each call opens its own control connection, logs in (anonymously unless the URL carries
//! credentials), switches to binary mode and issues `SIZE`/`MDTM` for metadata or
//! `PASV`/`REST`/`RETR` for data.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use udc_core::{RemoteInfo, RemoteSource, UdcError, UdcErrorKind, UdcResult};
use url::Url;

mod control;

use control::{Control, parse_mdtm, remote_err, with_timeout};

pub const DEFAULT_PORT: u16 = 21;
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "udc@";

#[derive(Clone, Debug, PartialEq, Eq)]
struct FtpTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    path: String,
}

fn parse_ftp_url(url: &str) -> UdcResult<FtpTarget> {
    let parsed = Url::parse(url).map_err(|err| {
        UdcError::with_message(UdcErrorKind::InvalidInput, format!("parse URL {url}: {err}"))
    })?;
    if parsed.scheme() != "ftp" {
        return Err(UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("unsupported scheme '{}' for FTP backend: {url}", parsed.scheme()),
        ));
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| {
            UdcError::with_message(UdcErrorKind::InvalidInput, format!("no host in {url}"))
        })?
        .to_string();
    let (user, password) = if parsed.username().is_empty() {
        (ANONYMOUS_USER.to_string(), ANONYMOUS_PASSWORD.to_string())
    } else {
        (
            parsed.username().to_string(),
            parsed.password().unwrap_or("").to_string(),
        )
    };
    Ok(FtpTarget {
        host,
        port: parsed.port().unwrap_or(DEFAULT_PORT),
        user,
        password,
        path: parsed.path().to_string(),
    })
}

/// [`RemoteSource`] for `ftp://` URLs.
#[derive(Clone, Debug)]
pub struct FtpSource {
    timeout: Duration,
}

impl Default for FtpSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl FtpSource {
    /// `timeout` bounds every connect and every reply wait.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, target: &FtpTarget) -> UdcResult<Control> {
        Control::login(
            &target.host,
            target.port,
            &target.user,
            &target.password,
            self.timeout,
        )
        .await
    }
}

#[async_trait]
impl RemoteSource for FtpSource {
    fn name(&self) -> &'static str {
        "ftp"
    }

    async fn fetch_info(&self, url: &str) -> UdcResult<Option<RemoteInfo>> {
        let target = parse_ftp_url(url)?;
        let mut control = self.connect(&target).await?;

        let size = control.command(&format!("SIZE {}", target.path)).await?;
        if size.is(550) {
            control.quit().await;
            return Ok(None);
        }
        if !size.is(213) {
            return Err(remote_err(format!(
                "FTP SIZE failed: {} {}",
                size.code, size.text
            )));
        }
        let size = size
            .text
            .trim()
            .parse::<u64>()
            .map_err(|_| remote_err(format!("malformed SIZE reply '{}'", size.text)))?;

        let mdtm = control.command(&format!("MDTM {}", target.path)).await?;
        if mdtm.is(550) {
            control.quit().await;
            return Ok(None);
        }
        if !mdtm.is(213) {
            return Err(remote_err(format!(
                "FTP MDTM failed: {} {}",
                mdtm.code, mdtm.text
            )));
        }
        let update_time = parse_mdtm(&mdtm.text)
            .ok_or_else(|| remote_err(format!("malformed MDTM reply '{}'", mdtm.text)))?;
        control.quit().await;

        tracing::debug!(%url, size, update_time, "ftp remote info");
        Ok(Some(RemoteInfo::new(size, update_time)))
    }

    async fn fetch_data(&self, url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let target = parse_ftp_url(url)?;
        let mut control = self.connect(&target).await?;
        let mut data = control.open_data().await?;
        if offset > 0 {
            control.expect(&format!("REST {offset}"), &[350]).await?;
        }
        control
            .expect(&format!("RETR {}", target.path), &[125, 150])
            .await?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let n = with_timeout(control.timeout(), "data read", data.read(&mut buf[filled..]))
                .await?
                .map_err(|err| remote_err(format!("read FTP data: {err}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // The transfer is abandoned once the caller's range is satisfied.
        drop(data);
        control.quit().await;

        tracing::trace!(%url, offset, read = filled, wanted = buf.len(), "ftp read done");
        Ok(filled)
    }
}
