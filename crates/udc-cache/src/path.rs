//! Mapping from URLs to cache directories and back.
//!
//! The part of the URL after the scheme is Q-encoded (`Q` followed by two uppercase hex
//! digits) so any URL becomes a safe relative path under `<root>/<scheme>/`. The encoding
//! is injective: distinct URLs, once credentials are stripped, never share a directory.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use udc_core::{UdcError, UdcErrorKind, UdcResult};

use crate::fileio::not_found_to_none;

pub const BITMAP_NAME: &str = "bitmap";
pub const SPARSE_DATA_NAME: &str = "sparseData";

const ESCAPE: u8 = b'Q';
/// Longest directory name written as-is; longer ones are replaced by their digest.
const MAX_SEGMENT_LEN: usize = 255;
/// Marks a digest segment. `Z` is not a hex digit, so `q_encode` never emits it.
const DIGEST_PREFIX: &str = "QZZ";

/// A URL split the way the cache lays it out on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UrlParts<'a> {
    pub scheme: &'a str,
    /// Everything after the scheme with leading slashes and any `user:pass@` removed.
    pub after_scheme: &'a str,
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Scheme of `url`, or `None` for a plain filesystem path.
pub fn scheme(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once(':')?;
    is_scheme(scheme).then_some(scheme)
}

/// Split `url` into scheme and cache-relevant remainder. `None` when there is no scheme.
pub fn split_url(url: &str) -> Option<UrlParts<'_>> {
    let scheme = scheme(url)?;
    let mut after = url[scheme.len() + 1..].trim_start_matches('/');
    if let Some(at) = after.find('@') {
        let host_end = after.find('/').unwrap_or(after.len());
        if at < host_end {
            after = &after[at + 1..];
        }
    }
    Some(UrlParts {
        scheme,
        after_scheme: after,
    })
}

fn needs_escape(byte: u8) -> bool {
    if byte.is_ascii_alphanumeric() {
        return byte == ESCAPE;
    }
    !matches!(byte, b'_' | b'-' | b'.' | b'/')
}

fn push_escaped(out: &mut String, byte: u8) {
    out.push(ESCAPE as char);
    out.push_str(&format!("{byte:02X}"));
}

/// Q-encode `input` into a relative path.
///
/// A `/` stays a separator only between two non-slash bytes, so leading, trailing and
/// repeated slashes survive as `Q2F`. Segments that are exactly `.` or `..` are escaped as
/// well.
pub fn q_encode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for (idx, &byte) in bytes.iter().enumerate() {
        if byte == b'/' {
            let between = idx > 0
                && idx + 1 < bytes.len()
                && bytes[idx - 1] != b'/'
                && bytes[idx + 1] != b'/';
            if between {
                out.push('/');
            } else {
                push_escaped(&mut out, byte);
            }
        } else if needs_escape(byte) {
            push_escaped(&mut out, byte);
        } else {
            out.push(byte as char);
        }
    }

    out.split('/')
        .map(|segment| match segment {
            "." => "Q2E".to_string(),
            ".." => "Q2EQ2E".to_string(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Reverse [`q_encode`]. Digest-shortened segments cannot be reversed and decode to their
/// own text, `QZZ` followed by the hex digest.
pub fn q_decode(input: &str) -> UdcResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx..].starts_with(DIGEST_PREFIX.as_bytes()) {
            out.extend_from_slice(DIGEST_PREFIX.as_bytes());
            idx += DIGEST_PREFIX.len();
        } else if bytes[idx] == ESCAPE {
            let byte = input
                .get(idx + 1..idx + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| {
                    UdcError::with_message(
                        UdcErrorKind::InvalidInput,
                        format!("malformed Q-escape in '{input}' at byte {idx}"),
                    )
                })?;
            out.push(byte);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).map_err(|_| {
        UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("Q-decoded '{input}' is not UTF-8"),
        )
    })
}

fn shorten_segments(encoded: &str) -> String {
    encoded
        .split('/')
        .map(|segment| {
            if segment.len() > MAX_SEGMENT_LEN {
                let digest = Sha256::digest(segment.as_bytes());
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                format!("{DIGEST_PREFIX}{hex}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Where one URL's cache entry lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePaths {
    pub dir: PathBuf,
    pub bitmap: PathBuf,
    pub sparse: PathBuf,
}

impl CachePaths {
    pub fn for_url(url: &str, cache_root: &Path) -> UdcResult<Self> {
        let parts = split_url(url).ok_or_else(|| {
            UdcError::with_message(
                UdcErrorKind::InvalidInput,
                format!("no scheme in '{url}', nothing to cache"),
            )
        })?;
        if parts.after_scheme.is_empty() {
            return Err(UdcError::with_message(
                UdcErrorKind::InvalidInput,
                format!("nothing after the scheme in '{url}'"),
            ));
        }
        let relative = shorten_segments(&q_encode(parts.after_scheme));
        let dir = cache_root.join(parts.scheme).join(relative);
        Ok(Self {
            bitmap: dir.join(BITMAP_NAME),
            sparse: dir.join(SPARSE_DATA_NAME),
            dir,
        })
    }
}

/// Translate a cache directory (or a file inside it) back into the URL it caches.
pub fn path_to_url(path: &Path, cache_root: &Path) -> UdcResult<String> {
    let invalid = |why: &str| {
        UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!(
                "{} is not a cache path under {}: {why}",
                path.display(),
                cache_root.display()
            ),
        )
    };
    let mut relative = path.strip_prefix(cache_root).unwrap_or(path);
    if relative
        .file_name()
        .is_some_and(|name| name == BITMAP_NAME || name == SPARSE_DATA_NAME)
    {
        relative = relative.parent().unwrap_or(relative);
    }
    let relative = relative.to_str().ok_or_else(|| invalid("not UTF-8"))?;
    let relative = relative.trim_start_matches('/');
    let (scheme, encoded) = relative
        .split_once('/')
        .ok_or_else(|| invalid("no scheme directory"))?;
    if !is_scheme(scheme) {
        return Err(invalid("first component is not a scheme"));
    }
    let decoded = q_decode(encoded)?;
    Ok(match scheme {
        "local" | "slow" => format!("{scheme}:/{decoded}"),
        _ => format!("{scheme}://{decoded}"),
    })
}

/// Cache files currently present for `url`.
pub fn cache_files(url: &str, cache_root: &Path) -> UdcResult<Vec<PathBuf>> {
    let paths = CachePaths::for_url(url, cache_root)?;
    let mut found = Vec::new();
    for file in [paths.bitmap, paths.sparse] {
        let meta = not_found_to_none(std::fs::metadata(&file))
            .map_err(|err| udc_core::io_err("stat cache file", err))?;
        if meta.is_some_and(|meta| meta.is_file()) {
            found.push(file);
        }
    }
    Ok(found)
}
