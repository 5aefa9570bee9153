//! Age-based eviction of cache entries.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{Level, debug, trace, warn};
use udc_core::{UdcError, UdcErrorKind, UdcResult};
use walkdir::WalkDir;

use crate::bitmap::BitmapFile;
use crate::fileio::{map_io_err, not_found_to_none};
use crate::path::{BITMAP_NAME, SPARSE_DATA_NAME};

const SECS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Remove entries under `cache_root` whose bitmap was last accessed more than
/// `max_age_days` ago. Returns the bytes held by those entries (bitmap plus sparse data),
/// which are left in place when `dry_run` is set.
pub fn cleanup(cache_root: &Path, max_age_days: f64, dry_run: bool) -> UdcResult<u64> {
    if !max_age_days.is_finite() || max_age_days < 0.0 {
        return Err(UdcError::with_message(
            UdcErrorKind::InvalidInput,
            format!("max age must be a non-negative number of days, got {max_age_days}"),
        ));
    }
    let cutoff = Duration::try_from_secs_f64(max_age_days * SECS_PER_DAY)
        .ok()
        .and_then(|max_age| SystemTime::now().checked_sub(max_age));
    let Some(cutoff) = cutoff else {
        debug!(max_age_days, "max age reaches past the epoch; nothing to clean");
        return Ok(0);
    };

    let mut total = 0u64;
    let mut entries = 0usize;
    for entry in WalkDir::new(cache_root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let missing = err.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound);
                if err.depth() == 0 && missing {
                    debug!(root = %cache_root.display(), "cache root missing; nothing to clean");
                    return Ok(0);
                }
                warn!(error = %err, "skipping unreadable cache path");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != BITMAP_NAME {
            continue;
        }
        let bitmap_path = entry.path();
        let meta = entry.metadata().map_err(|err| {
            UdcError::with_message(
                UdcErrorKind::Io,
                format!("stat {}: {err}", bitmap_path.display()),
            )
        })?;
        let accessed = meta
            .accessed()
            .or_else(|_| meta.modified())
            .map_err(map_io_err("read bitmap access time"))?;
        if accessed >= cutoff {
            continue;
        }

        let Some(dir) = bitmap_path.parent() else {
            continue;
        };
        let sparse_path = dir.join(SPARSE_DATA_NAME);
        let sparse_len = not_found_to_none(fs::metadata(&sparse_path))
            .map_err(map_io_err("stat sparse data"))?
            .map_or(0, |meta| meta.len());
        if tracing::enabled!(Level::TRACE) {
            log_real_size(bitmap_path);
        }

        total += meta.len() + sparse_len;
        entries += 1;
        debug!(
            dir = %dir.display(),
            bytes = meta.len() + sparse_len,
            dry_run,
            "expired cache entry"
        );
        if dry_run {
            continue;
        }
        not_found_to_none(fs::remove_file(bitmap_path)).map_err(map_io_err("remove bitmap"))?;
        not_found_to_none(fs::remove_file(&sparse_path))
            .map_err(map_io_err("remove sparse data"))?;
        if let Err(err) = fs::remove_dir(dir) {
            trace!(dir = %dir.display(), error = %err, "cache directory left in place");
        }
    }
    debug!(root = %cache_root.display(), entries, total, dry_run, "cache cleanup finished");
    Ok(total)
}

fn log_real_size(bitmap_path: &Path) {
    let cached = BitmapFile::open(bitmap_path).and_then(|bitmap| {
        bitmap
            .map(|bitmap| {
                let block_size = u64::from(bitmap.header().block_size);
                let blocks = bitmap.count_cached()?;
                Ok((blocks * block_size).min(bitmap.header().remote_size))
            })
            .transpose()
    });
    match cached {
        Ok(Some(bytes)) => trace!(bitmap = %bitmap_path.display(), bytes, "real cached data"),
        Ok(None) => trace!(bitmap = %bitmap_path.display(), "bitmap header incomplete"),
        Err(err) => trace!(bitmap = %bitmap_path.display(), error = %err, "unreadable bitmap"),
    }
}
