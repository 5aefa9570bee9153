use crate::{DATA_MAX_REDIRECTS, HttpConfig, HttpError, INFO_MAX_REDIRECTS};
use http::HeaderMap;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RANGE};
use reqwest::Client as ReqwestClient;
use reqwest::StatusCode;
use reqwest::redirect::Policy;
use std::ops::RangeInclusive;
use udc_core::{RemoteInfo, UdcError, UdcErrorKind};
use url::Url;

#[derive(Clone)]
pub struct Client {
    info: ReqwestClient,
    data: ReqwestClient,
}

impl Client {
    pub fn new(config: HttpConfig) -> Result<Self, UdcError> {
        let build = |redirects: usize| {
            ReqwestClient::builder()
                .connect_timeout(config.connect_timeout)
                .timeout(config.timeout)
                .redirect(Policy::limited(redirects))
                .build()
                .map_err(|err| {
                    UdcError::with_message(UdcErrorKind::Io, format!("build HTTP client: {err}"))
                })
        };
        Ok(Self {
            info: build(INFO_MAX_REDIRECTS)?,
            data: build(DATA_MAX_REDIRECTS)?,
        })
    }

    /// Size and Last-Modified of `url`. `Ok(None)` when the server says the resource is
    /// not there.
    pub async fn fetch_info(&self, url: &Url) -> Result<Option<RemoteInfo>, HttpError> {
        tracing::debug!(%url, "http HEAD");
        let head = self
            .info
            .head(url.as_str())
            .send()
            .await
            .map_err(|source| HttpError::Request { op: "HEAD", source })?;
        let status = head.status();
        tracing::debug!(status = %status, "http HEAD response");

        if status.is_success() {
            if let Some(size) = header_u64(head.headers(), CONTENT_LENGTH) {
                return info_from_headers(head.headers(), size).map(Some);
            }
        } else if status != StatusCode::FORBIDDEN {
            return Ok(None);
        }

        // Some servers refuse HEAD or leave out Content-Length; ask for a single byte instead.
        tracing::debug!(%url, "http one-byte range GET");
        let ranged = self
            .info
            .get(url.as_str())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|source| HttpError::Request {
                op: "ranged GET",
                source,
            })?;
        let status = ranged.status();
        tracing::debug!(status = %status, "http ranged GET response");
        if !status.is_success() {
            return Ok(None);
        }
        let size = ranged
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| {
                (status == StatusCode::OK)
                    .then(|| header_u64(ranged.headers(), CONTENT_LENGTH))
                    .flatten()
            })
            .ok_or_else(|| {
                HttpError::Msg(format!("unable to determine content length of {url}"))
            })?;
        info_from_headers(ranged.headers(), size).map(Some)
    }

    pub async fn read_range(
        &self,
        url: &Url,
        range: RangeInclusive<u64>,
        buf: &mut [u8],
    ) -> Result<usize, HttpError> {
        let start = *range.start();
        let end = *range.end();
        let wanted = range_len(start, end)?;
        let header = format!("bytes={start}-{end}");

        let resp = self
            .data
            .get(url.as_str())
            .header(RANGE, &header)
            .send()
            .await
            .map_err(|source| HttpError::Request { op: "GET", source })?;

        let status = resp.status();
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string());
        tracing::trace!(
            status = %status,
            start,
            end,
            content_range = ?content_range,
            "http read response"
        );

        let got_end = validate_range_response(status, content_range.as_deref(), start, end)
            .map_err(HttpError::Msg)?;
        let expected_len = range_len(start, got_end)?;

        let bytes = resp.bytes().await.map_err(|source| HttpError::Request {
            op: "read body",
            source,
        })?;
        if bytes.len() != expected_len {
            return Err(HttpError::Msg(format!(
                "range body length mismatch: got {}, expected {}",
                bytes.len(),
                expected_len
            )));
        }

        buf[..expected_len].copy_from_slice(&bytes);
        tracing::trace!(read = expected_len, wanted, "http read done");
        Ok(expected_len)
    }
}

fn header_u64(headers: &HeaderMap, name: http::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

fn info_from_headers(headers: &HeaderMap, size: u64) -> Result<RemoteInfo, HttpError> {
    let raw = headers
        .get(LAST_MODIFIED)
        .ok_or_else(|| HttpError::Msg("response has no Last-Modified header".into()))?
        .to_str()
        .map_err(|_| HttpError::Msg("Last-Modified header is not ASCII".into()))?;
    let update_time = parse_http_date(raw)
        .ok_or_else(|| HttpError::Msg(format!("invalid Last-Modified header '{raw}'")))?;
    Ok(RemoteInfo::new(size, update_time))
}

/// Parse an RFC 7231 IMF-fixdate (`Wed, 15 Nov 1995 04:58:08 GMT`) into Unix seconds.
pub(crate) fn parse_http_date(raw: &str) -> Option<u64> {
    let parsed = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}

fn range_len(start: u64, end: u64) -> Result<usize, HttpError> {
    end.checked_sub(start)
        .and_then(|delta| delta.checked_add(1))
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| HttpError::Msg("range length overflow".into()))
}

/// Check a ranged response and return the last byte it actually covers. The server may
/// stop short of `expected_end` only when the resource ends there.
fn validate_range_response(
    status: StatusCode,
    content_range: Option<&str>,
    expected_start: u64,
    expected_end: u64,
) -> Result<u64, String> {
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(format!("GET status {status} (expected 206 Partial Content)"));
    }

    let content_range =
        content_range.ok_or_else(|| "missing Content-Range on partial response".to_string())?;
    let (start, end, total) = parse_content_range(content_range)
        .ok_or_else(|| format!("invalid Content-Range header '{content_range}'"))?;
    let short_at_eof = end < expected_end && total == Some(end + 1);
    if start != expected_start || (end != expected_end && !short_at_eof) {
        return Err(format!(
            "content-range mismatch: got bytes {start}-{end}, \
             expected bytes {expected_start}-{expected_end}"
        ));
    }
    Ok(end)
}

fn parse_content_range_total(hdr: &str) -> Option<u64> {
    parse_content_range(hdr).and_then(|(_, _, total)| total)
}

fn parse_content_range(hdr: &str) -> Option<(u64, u64, Option<u64>)> {
    // e.g. "bytes 0-0/12345"
    let hdr = hdr.trim().strip_prefix("bytes ")?;
    let (span, total) = hdr.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = if total == "*" {
        None
    } else {
        Some(total.parse::<u64>().ok()?)
    };
    Some((start, end, total))
}
