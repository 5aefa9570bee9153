use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace, warn};
use udc_core::{RemoteInfo, RemoteSource, UdcError, UdcErrorKind, UdcResult, bits};

use crate::bitmap::{self, BitmapFile};
use crate::config::UdcConfig;
use crate::fileio::{
    map_io_err, not_found_to_none, read_exact_at, read_full_at, same_file, write_all_at,
};
use crate::local;
use crate::path::{self, CachePaths};
use crate::protocol::Protocol;
use crate::stats::IoStats;

/// Blocks inspected when seeding the known-good window on open.
const INITIAL_WINDOW_BLOCKS: u64 = 8;

/// Reads shorter than this are served through the read-ahead buffer.
const READ_AHEAD_LEN: u64 = 4096;

/// Bytes pulled from the sparse or local file ahead of small reads.
#[derive(Default)]
struct ReadAhead {
    start: u64,
    data: Vec<u8>,
}

impl ReadAhead {
    fn clear(&mut self) {
        self.data.clear();
    }

    /// Copy out up to `out.len()` bytes at `offset`. Zero when `offset` is not buffered.
    fn copy_out(&self, offset: u64, out: &mut [u8]) -> usize {
        let Some(skip) = offset
            .checked_sub(self.start)
            .and_then(|skip| usize::try_from(skip).ok())
        else {
            return 0;
        };
        let Some(held) = self.data.get(skip..) else {
            return 0;
        };
        let count = held.len().min(out.len());
        out[..count].copy_from_slice(&held[..count]);
        count
    }

    fn covers(&self, offset: u64, len: usize) -> bool {
        let buffered_end = self.start + self.data.len() as u64;
        !self.data.is_empty() && offset >= self.start && offset + len as u64 <= buffered_end
    }

    fn load(&mut self, file: &File, offset: u64, len: usize) -> std::io::Result<usize> {
        self.data.resize(len, 0);
        self.start = offset;
        let read = read_full_at(file, &mut self.data, offset)?;
        self.data.truncate(read);
        Ok(read)
    }
}

struct CacheEntry {
    source: Arc<dyn RemoteSource>,
    paths: CachePaths,
    sparse: File,
}

enum Storage {
    /// Scheme-less local path, read in place.
    Transparent(File),
    /// Caching disabled; every read goes to the backend.
    Uncached(Arc<dyn RemoteSource>),
    Cached(CacheEntry),
}

/// Random-access handle on a remote resource, backed by the local block cache.
///
/// Reads inside the known-good window `[start_data, end_data)` are served straight from
/// the sparse file. Anything else consults the on-disk bitmap and fetches the missing block
/// runs first.
pub struct UdcFile {
    url: String,
    protocol: &'static str,
    size: u64,
    update_time: u64,
    block_size: u64,
    chunk_bytes: u64,
    sync_data: bool,
    offset: u64,
    start_data: u64,
    end_data: u64,
    bitmap_version: u32,
    storage: Storage,
    ahead: ReadAhead,
    stats: IoStats,
}

impl UdcFile {
    /// Open `url`, picking the backend from its scheme. `Ok(None)` when the resource does
    /// not exist.
    pub async fn open(url: &str, config: &UdcConfig) -> UdcResult<Option<Self>> {
        config.validate()?;
        let protocol = Protocol::from_url(url)?;
        match protocol.source(config)? {
            Some(source) => Self::open_with_source(url, source, config).await,
            None => Self::open_transparent(url, config),
        }
    }

    /// Open `url` through a caller-supplied backend.
    pub async fn open_with_source(
        url: &str,
        source: Arc<dyn RemoteSource>,
        config: &UdcConfig,
    ) -> UdcResult<Option<Self>> {
        config.validate()?;
        let paths = match &config.cache_root {
            Some(root) => Some(CachePaths::for_url(url, root)?),
            None => None,
        };
        let trusted = match &paths {
            Some(paths) => trusted_cached_info(paths, config.cache_timeout)?,
            None => None,
        };
        let info = match trusted {
            Some(info) => {
                debug!(%url, size = info.size, "using cached remote info");
                info
            }
            None => match source.fetch_info(url).await? {
                Some(info) => info,
                None => {
                    debug!(%url, protocol = source.name(), "remote info unavailable");
                    return Ok(None);
                }
            },
        };
        let protocol = source.name();

        let Some(paths) = paths else {
            debug!(%url, protocol, size = info.size, "opened without cache");
            return Ok(Some(Self::assemble(
                url,
                protocol,
                info,
                config,
                Storage::Uncached(source),
            )));
        };

        fs::create_dir_all(&paths.dir).map_err(map_io_err("create cache directory"))?;
        let bitmap = bitmap::open_or_rebuild(&paths, info, config.block_size)?;
        if trusted.is_none() && !config.cache_timeout.is_zero() {
            bitmap.touch()?;
        }
        let sparse = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&paths.sparse)
            .map_err(map_io_err("open sparse data"))?;
        let end_data = initial_window_end(&bitmap, info.size)?;
        let version = bitmap.version();
        debug!(
            %url,
            protocol,
            size = info.size,
            version,
            end_data,
            cache_dir = %paths.dir.display(),
            "opened cached file"
        );

        let mut file = Self::assemble(
            url,
            protocol,
            info,
            config,
            Storage::Cached(CacheEntry {
                source,
                paths,
                sparse,
            }),
        );
        file.bitmap_version = version;
        file.end_data = end_data;
        file.stats.bitmap.record_read(bitmap::HEADER_LEN);
        Ok(Some(file))
    }

    fn open_transparent(url: &str, config: &UdcConfig) -> UdcResult<Option<Self>> {
        let path = Path::new(url);
        let Some(info) = local::file_info(path)? else {
            debug!(%url, "local file missing");
            return Ok(None);
        };
        let file = File::open(path).map_err(map_io_err("open local file"))?;
        let mut handle = Self::assemble(
            url,
            Protocol::Transparent.name(),
            info,
            config,
            Storage::Transparent(file),
        );
        handle.end_data = info.size;
        Ok(Some(handle))
    }

    fn assemble(
        url: &str,
        protocol: &'static str,
        info: RemoteInfo,
        config: &UdcConfig,
        storage: Storage,
    ) -> Self {
        Self {
            url: url.to_string(),
            protocol,
            size: info.size,
            update_time: info.update_time,
            block_size: u64::from(config.block_size),
            chunk_bytes: config.chunk_bytes(),
            sync_data: config.sync_data,
            offset: 0,
            start_data: 0,
            end_data: 0,
            bitmap_version: 0,
            storage,
            ahead: ReadAhead::default(),
            stats: IoStats::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remote modification time, seconds since the Unix epoch.
    pub fn update_time(&self) -> u64 {
        self.update_time
    }

    pub fn bitmap_version(&self) -> u32 {
        self.bitmap_version
    }

    /// Byte range known to be present in the sparse file without consulting the bitmap.
    pub fn known_good_window(&self) -> (u64, u64) {
        (self.start_data, self.end_data)
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.stats
    }

    /// Directory holding this handle's cache entry, if it has one.
    pub fn cache_dir(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Cached(entry) => Some(&entry.paths.dir),
            _ => None,
        }
    }

    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
        self.ahead.clear();
    }

    pub fn seek_cur(&mut self, delta: i64) -> UdcResult<()> {
        self.offset = self.offset.checked_add_signed(delta).ok_or_else(|| {
            UdcError::with_message(
                UdcErrorKind::InvalidInput,
                format!("seek by {delta} from {} leaves the file", self.offset),
            )
        })?;
        self.ahead.clear();
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Release the handle, logging its I/O statistics.
    pub fn close(self) {
        self.stats.log(&self.url);
    }

    fn window_covers(&self, start: u64, end: u64) -> bool {
        start >= self.start_data && end <= self.end_data
    }

    /// Read up to `buf.len()` bytes at the cursor and advance it.
    ///
    /// Returns `Ok(0)` at end of file, and also when the cache entry was rebuilt by another
    /// handle since this one was opened; the cursor does not move in that case.
    pub async fn read(&mut self, buf: &mut [u8]) -> UdcResult<usize> {
        if buf.is_empty() || self.offset >= self.size {
            self.stats.caller.record_read(0);
            return Ok(0);
        }
        let start = self.offset;
        let len = (buf.len() as u64).min(self.size - start) as usize;
        let end = start + len as u64;
        let out = &mut buf[..len];

        if matches!(self.storage, Storage::Cached(_))
            && !self.window_covers(start, end)
            && !self.fill(start, end).await?
        {
            return Ok(0);
        }

        let small = (len as u64) < READ_AHEAD_LEN;
        let read = match &self.storage {
            Storage::Transparent(_) | Storage::Cached(_) if self.ahead.covers(start, len) => {
                self.ahead.copy_out(start, out)
            }
            Storage::Transparent(file) if small => {
                let ahead_end = self.size.min(start + READ_AHEAD_LEN);
                self.ahead
                    .load(file, start, (ahead_end - start) as usize)
                    .map_err(map_io_err("read local file"))?;
                self.ahead.copy_out(start, out)
            }
            Storage::Transparent(file) => {
                read_full_at(file, out, start).map_err(map_io_err("read local file"))?
            }
            Storage::Uncached(source) => {
                let read = source.fetch_data(&self.url, start, out).await?;
                self.stats.remote.record_read(read);
                read
            }
            Storage::Cached(entry) if small => {
                let ahead_end = self.end_data.min(start + READ_AHEAD_LEN).max(end);
                let loaded = self
                    .ahead
                    .load(&entry.sparse, start, (ahead_end - start) as usize)
                    .map_err(map_io_err("read sparse data"))?;
                self.stats.sparse.record_read(loaded);
                if self.ahead.copy_out(start, out) != len {
                    return Err(UdcError::with_message(
                        UdcErrorKind::Io,
                        format!("short sparse read at {start} ({loaded} of {len} bytes)"),
                    ));
                }
                len
            }
            Storage::Cached(entry) => {
                read_exact_at(&entry.sparse, out, start, "read sparse data")?;
                self.stats.sparse.record_read(len);
                len
            }
        };
        self.offset = start + read as u64;
        self.stats.caller.record_read(read);
        Ok(read)
    }

    /// Make `[offset, offset + len)` (clipped to the file) present in the cache without
    /// copying it out. `Ok(false)` when the entry was rebuilt underneath this handle.
    pub async fn preload(&mut self, offset: u64, len: u64) -> UdcResult<bool> {
        let start = offset.min(self.size);
        let end = offset.saturating_add(len).min(self.size);
        if start >= end || self.window_covers(start, end) {
            return Ok(true);
        }
        self.fill(start, end).await
    }

    /// Bring `[start, end)` into the cache, `chunk_bytes` at a time.
    async fn fill(&mut self, start: u64, end: u64) -> UdcResult<bool> {
        let Storage::Cached(entry) = &self.storage else {
            return Ok(true);
        };
        let block_size = self.block_size;
        let mut pos = start;
        while pos < end {
            let chunk_end = end.min(pos.saturating_add(self.chunk_bytes));
            let Some(bitmap) = BitmapFile::open(&entry.paths.bitmap)? else {
                warn!(url = %self.url, "bitmap missing; cache entry rebuilt elsewhere");
                return Ok(false);
            };
            self.stats.bitmap.record_read(bitmap::HEADER_LEN);
            if bitmap.version() != self.bitmap_version {
                warn!(
                    url = %self.url,
                    expected = self.bitmap_version,
                    found = bitmap.version(),
                    "bitmap version changed; cache entry rebuilt elsewhere"
                );
                return Ok(false);
            }
            let replaced = !same_file(&entry.sparse, &entry.paths.sparse)
                .map_err(map_io_err("stat sparse data"))?;
            if replaced {
                warn!(url = %self.url, "sparse data replaced; cache entry rebuilt elsewhere");
                return Ok(false);
            }
            self.ahead.clear();

            let start_block = pos / block_size;
            let end_block = chunk_end.div_ceil(block_size);
            fetch_missing(
                entry,
                &bitmap,
                &self.url,
                self.size,
                block_size,
                start_block..end_block,
                self.sync_data,
                &mut self.stats,
            )
            .await?;

            let fetched_start = start_block * block_size;
            let fetched_end = (end_block * block_size).min(self.size);
            if fetched_start <= self.end_data && self.start_data <= fetched_end {
                self.start_data = self.start_data.min(fetched_start);
                self.end_data = self.end_data.max(fetched_end);
            } else {
                self.start_data = fetched_start;
                self.end_data = fetched_end;
            }
            trace!(
                url = %self.url,
                start_data = self.start_data,
                end_data = self.end_data,
                "known-good window"
            );
            pos = chunk_end;
        }
        Ok(true)
    }

    /// Read exactly `buf.len()` bytes or fail with [`UdcErrorKind::UnexpectedEof`].
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> UdcResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let read = self.read(&mut buf[filled..]).await?;
            if read == 0 {
                return Err(UdcError::with_message(
                    UdcErrorKind::UnexpectedEof,
                    format!(
                        "couldn't read {} bytes from {}, did read {filled}",
                        buf.len(),
                        self.url
                    ),
                ));
            }
            filled += read;
        }
        Ok(())
    }

    async fn read_array<const N: usize>(&mut self) -> UdcResult<[u8; N]> {
        let mut raw = [0u8; N];
        self.read_exact(&mut raw).await?;
        Ok(raw)
    }

    pub async fn read_u8(&mut self) -> UdcResult<u8> {
        Ok(self.read_array::<1>().await?[0])
    }

    /// Native-order 16-bit value, byte-swapped when `swapped` is set.
    pub async fn read_u16(&mut self, swapped: bool) -> UdcResult<u16> {
        let value = u16::from_ne_bytes(self.read_array().await?);
        Ok(if swapped { value.swap_bytes() } else { value })
    }

    pub async fn read_u32(&mut self, swapped: bool) -> UdcResult<u32> {
        let value = u32::from_ne_bytes(self.read_array().await?);
        Ok(if swapped { value.swap_bytes() } else { value })
    }

    pub async fn read_u64(&mut self, swapped: bool) -> UdcResult<u64> {
        let value = u64::from_ne_bytes(self.read_array().await?);
        Ok(if swapped { value.swap_bytes() } else { value })
    }

    pub async fn read_f32(&mut self, swapped: bool) -> UdcResult<f32> {
        Ok(f32::from_bits(self.read_u32(swapped).await?))
    }

    pub async fn read_f64(&mut self, swapped: bool) -> UdcResult<f64> {
        Ok(f64::from_bits(self.read_u64(swapped).await?))
    }

    /// Next line without its `\n`. `None` at end of file; a final unterminated line is
    /// returned as-is.
    pub async fn read_line(&mut self) -> UdcResult<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.read(&mut byte).await? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Zero-terminated string. Running out of file first is an error.
    pub async fn read_string_zero(&mut self) -> UdcResult<String> {
        let mut out = Vec::new();
        loop {
            match self.read_u8().await? {
                0 => break,
                byte => out.push(byte),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// String stored as a length byte followed by that many bytes. `None` at end of file.
    pub async fn read_short_string(&mut self) -> UdcResult<Option<String>> {
        let mut len = [0u8; 1];
        if self.read(&mut len).await? == 0 {
            return Ok(None);
        }
        let mut out = vec![0u8; usize::from(len[0])];
        self.read_exact(&mut out).await?;
        Ok(Some(String::from_utf8_lossy(&out).into_owned()))
    }

    /// Blocks in `[start_block, end_block)` not yet marked present in the bitmap.
    pub fn check_cache_bits(&self, start_block: u64, end_block: u64) -> UdcResult<Vec<u64>> {
        let Storage::Cached(entry) = &self.storage else {
            return Ok(Vec::new());
        };
        match BitmapFile::open(&entry.paths.bitmap)? {
            Some(bitmap) => {
                let missing = bitmap::clear_blocks(&bitmap, start_block, end_block)?;
                for block in &missing {
                    warn!(
                        url = %self.url,
                        block,
                        start = block * self.block_size,
                        end = (block + 1) * self.block_size,
                        "block not cached"
                    );
                }
                Ok(missing)
            }
            None => Ok((start_block..end_block.min(self.size.div_ceil(self.block_size))).collect()),
        }
    }

    /// Blocks currently present in the cache entry.
    pub fn cached_blocks(&self) -> UdcResult<u64> {
        let Storage::Cached(entry) = &self.storage else {
            return Ok(0);
        };
        match BitmapFile::open(&entry.paths.bitmap)? {
            Some(bitmap) => bitmap.count_cached(),
            None => Ok(0),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_missing(
    entry: &CacheEntry,
    bitmap: &BitmapFile,
    url: &str,
    size: u64,
    block_size: u64,
    blocks: std::ops::Range<u64>,
    sync_data: bool,
    stats: &mut IoStats,
) -> UdcResult<()> {
    let (mut bytes, first) = bitmap.read_bits(blocks.start, blocks.end)?;
    stats.bitmap.record_read(bytes.len());
    let limit = blocks.end - first;

    let mut idx = bits::find_clear(&bytes, blocks.start - first, limit);
    while idx < limit {
        let run_end = bits::find_set(&bytes, idx, limit);
        let fetch_start = (first + idx) * block_size;
        let fetch_end = ((first + run_end) * block_size).min(size);
        let len = (fetch_end - fetch_start) as usize;
        trace!(
            %url,
            first_block = first + idx,
            blocks = run_end - idx,
            fetch_start,
            len,
            "fetching uncached run"
        );

        let mut data = vec![0u8; len];
        let got = entry.source.fetch_data(url, fetch_start, &mut data).await?;
        stats.remote.record_read(got);
        if got != len {
            return Err(UdcError::with_message(
                UdcErrorKind::Remote,
                format!("unable to fetch {len} bytes from {url} @{fetch_start} (got {got} bytes)"),
            ));
        }
        write_all_at(&entry.sparse, &data, fetch_start).map_err(map_io_err("write sparse data"))?;
        stats.sparse.record_write(len);
        if sync_data {
            entry
                .sparse
                .sync_data()
                .map_err(map_io_err("sync sparse data"))?;
        }

        bits::set_range(&mut bytes, idx, run_end - idx);
        bitmap.write_bits(first / 8, &bytes)?;
        stats.bitmap.record_write(bytes.len());
        idx = bits::find_clear(&bytes, run_end, limit);
    }
    Ok(())
}

/// Cached remote info, when the entry's bitmap was confirmed within `timeout`.
fn trusted_cached_info(paths: &CachePaths, timeout: Duration) -> UdcResult<Option<RemoteInfo>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match bitmap_age(&paths.bitmap)? {
        Some(age) if age < timeout => {
            Ok(bitmap::read_header(&paths.bitmap)?.map(|header| header.remote_info()))
        }
        _ => Ok(None),
    }
}

fn bitmap_age(bitmap: &Path) -> UdcResult<Option<Duration>> {
    let meta = not_found_to_none(fs::metadata(bitmap)).map_err(map_io_err("stat bitmap"))?;
    Ok(meta.and_then(|meta| meta.modified().ok()).map(|mtime| {
        SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO)
    }))
}

fn initial_window_end(bitmap: &BitmapFile, size: u64) -> UdcResult<u64> {
    let blocks = bitmap.header().block_count().min(INITIAL_WINDOW_BLOCKS);
    let (bytes, _) = bitmap.read_bits(0, blocks)?;
    let first_clear = bits::find_clear(&bytes, 0, blocks);
    Ok((first_clear * u64::from(bitmap.header().block_size)).min(size))
}

/// Read a whole resource into memory. A non-zero `max_size` caps the accepted size.
pub async fn read_all(url: &str, config: &UdcConfig, max_size: u64) -> UdcResult<Vec<u8>> {
    let mut file = UdcFile::open(url, config).await?.ok_or_else(|| {
        UdcError::with_message(UdcErrorKind::Remote, format!("{url} does not exist"))
    })?;
    if max_size != 0 && file.size() > max_size {
        return Err(UdcError::with_message(
            UdcErrorKind::TooLarge,
            format!("{url} is {} bytes, limit is {max_size}", file.size()),
        ));
    }
    let len = usize::try_from(file.size()).map_err(|_| {
        UdcError::with_message(UdcErrorKind::TooLarge, format!("{url} does not fit in memory"))
    })?;
    let mut out = vec![0u8; len];
    file.read_exact(&mut out).await?;
    file.close();
    Ok(out)
}

/// Remote size recorded in the cache entry for `url`, without touching the network.
pub fn size_from_cache(url: &str, cache_root: &Path) -> UdcResult<Option<u64>> {
    let paths = CachePaths::for_url(url, cache_root)?;
    Ok(bitmap::read_header(&paths.bitmap)?.map(|header| header.remote_size))
}

/// Remote modification time recorded in the cache entry for `url`.
pub fn time_from_cache(url: &str, cache_root: &Path) -> UdcResult<Option<u64>> {
    let paths = CachePaths::for_url(url, cache_root)?;
    Ok(bitmap::read_header(&paths.bitmap)?.map(|header| header.remote_update))
}

/// Time since the entry's remote metadata was last confirmed. `None` when not cached.
pub fn cache_age(url: &str, cache_root: &Path) -> UdcResult<Option<Duration>> {
    let paths = CachePaths::for_url(url, cache_root)?;
    bitmap_age(&paths.bitmap)
}

/// Size of `url`, preferring local knowledge (the file itself or its cache entry) over a
/// remote lookup. `None` when the resource does not exist.
pub async fn remote_size(url: &str, config: &UdcConfig) -> UdcResult<Option<u64>> {
    let protocol = Protocol::from_url(url)?;
    let Some(source) = protocol.source(config)? else {
        return Ok(local::file_info(Path::new(url))?.map(|info| info.size));
    };
    if let Some(root) = &config.cache_root {
        if let Some(size) = size_from_cache(url, root)? {
            return Ok(Some(size));
        }
    }
    Ok(source.fetch_info(url).await?.map(|info| info.size))
}

/// Whether `url` names an existing local or remote resource.
pub async fn exists(url: &str, config: &UdcConfig) -> UdcResult<bool> {
    Ok(remote_size(url, config).await?.is_some())
}

/// True for plain filesystem paths (no scheme).
pub fn is_local(url: &str) -> bool {
    path::scheme(url).is_none()
}
