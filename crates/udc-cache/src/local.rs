//! Filesystem-backed sources: `local:` paths, the latency-injecting `slow:` variant, and the
//! scheme-less paths read in place.

use std::fs::{File, Metadata};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::trace;
use udc_core::{RemoteInfo, RemoteSource, UdcError, UdcErrorKind, UdcResult};

use crate::config::SlowDelays;
use crate::fileio::{map_io_err, not_found_to_none, read_full_at};

const SLOW_STEP: usize = 1024;

/// Validate the path part of a `local:` or `slow:` URL.
///
/// The path must be absolute and may not contain `..`, `~`, `//`, `/./`, or end in `/.`.
pub fn checked_local_path(url: &str, scheme: &str) -> UdcResult<PathBuf> {
    let path = url
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| {
            UdcError::with_message(
                UdcErrorKind::InvalidInput,
                format!("expected a {scheme}: URL, got '{url}'"),
            )
        })?;
    let unsafe_part = ["..", "~", "//", "/./"]
        .into_iter()
        .find(|needle| path.contains(needle))
        .or_else(|| path.ends_with("/.").then_some("/."));
    if !path.starts_with('/') {
        return Err(UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("{scheme}: path must be absolute: '{url}'"),
        ));
    }
    if let Some(part) = unsafe_part {
        return Err(UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("{scheme}: path may not contain '{part}': '{url}'"),
        ));
    }
    Ok(PathBuf::from(path))
}

fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|age| age.as_secs())
        .unwrap_or(0)
}

/// Size and mtime of a local file, `None` if it does not exist.
pub fn file_info(path: &Path) -> UdcResult<Option<RemoteInfo>> {
    let meta = not_found_to_none(std::fs::metadata(path)).map_err(map_io_err("stat local file"))?;
    Ok(meta
        .filter(|meta| meta.is_file())
        .map(|meta| RemoteInfo::new(meta.len(), mtime_secs(&meta))))
}

fn open_local(path: &Path) -> UdcResult<File> {
    File::open(path).map_err(|err| {
        UdcError::with_message(
            UdcErrorKind::Remote,
            format!("open {}: {err}", path.display()),
        )
    })
}

/// `local:/abs/path` backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSource;

#[async_trait]
impl RemoteSource for LocalSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch_info(&self, url: &str) -> UdcResult<Option<RemoteInfo>> {
        file_info(&checked_local_path(url, "local")?)
    }

    async fn fetch_data(&self, url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize> {
        let file = open_local(&checked_local_path(url, "local")?)?;
        read_full_at(&file, buf, offset).map_err(map_io_err("read local file"))
    }
}

/// `slow:/abs/path` backend: a local file with artificial latency, used to exercise the
/// cache against a backend whose calls are expensive.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlowSource {
    delays: SlowDelays,
}

impl SlowSource {
    pub fn new(delays: SlowDelays) -> Self {
        Self { delays }
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl RemoteSource for SlowSource {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn fetch_info(&self, url: &str) -> UdcResult<Option<RemoteInfo>> {
        let path = checked_local_path(url, "slow")?;
        pause(self.delays.per_call).await;
        file_info(&path)
    }

    async fn fetch_data(&self, url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize> {
        let path = checked_local_path(url, "slow")?;
        pause(self.delays.per_call).await;
        let file = open_local(&path)?;
        let mut filled = 0usize;
        while filled < buf.len() {
            let want = SLOW_STEP.min(buf.len() - filled);
            let read = read_full_at(&file, &mut buf[filled..filled + want], offset + filled as u64)
                .map_err(map_io_err("read slow file"))?;
            filled += read;
            trace!(%url, filled, "slow read step");
            pause(self.delays.per_kib).await;
            if read < want {
                break;
            }
        }
        Ok(filled)
    }
}
