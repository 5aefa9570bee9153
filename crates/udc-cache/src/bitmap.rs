//! On-disk bitmap: a 64-byte header followed by one bit per cached block.
//!
//! Header layout (byte order given by the signature):
//!
//! ```text
//! 0   signature      u32  0x4187E2F6
//! 4   block_size     u32
//! 8   remote_update  u64  seconds since the Unix epoch
//! 16  remote_size    u64
//! 24  version        u32  generation, bumped on every rebuild
//! 28  reserved       u32
//! 32  reserved       u64 x 4
//! 64  bitmap bytes, bit 0 = high bit of the first byte
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, trace};
use udc_core::{RemoteInfo, UdcError, UdcErrorKind, UdcResult, bits, io_err};

use crate::fileio::{map_io_err, not_found_to_none, read_full_at, write_all_at};
use crate::path::CachePaths;

pub const SIGNATURE: u32 = 0x4187_E2F6;
pub const HEADER_LEN: usize = 64;
const ZERO_CHUNK_LEN: usize = 4096;

/// Byte order of a bitmap header as found on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapHeader {
    pub block_size: u32,
    pub remote_update: u64,
    pub remote_size: u64,
    pub version: u32,
}

impl BitmapHeader {
    pub fn new(block_size: u32, info: RemoteInfo, version: u32) -> Self {
        Self {
            block_size,
            remote_update: info.update_time,
            remote_size: info.size,
            version,
        }
    }

    pub fn remote_info(&self) -> RemoteInfo {
        RemoteInfo::new(self.remote_size, self.remote_update)
    }

    /// Number of blocks, and so bits, covering the remote resource.
    pub fn block_count(&self) -> u64 {
        self.remote_size.div_ceil(u64::from(self.block_size))
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        match order {
            ByteOrder::Little => {
                out[0..4].copy_from_slice(&SIGNATURE.to_le_bytes());
                out[4..8].copy_from_slice(&self.block_size.to_le_bytes());
                out[8..16].copy_from_slice(&self.remote_update.to_le_bytes());
                out[16..24].copy_from_slice(&self.remote_size.to_le_bytes());
                out[24..28].copy_from_slice(&self.version.to_le_bytes());
            }
            ByteOrder::Big => {
                out[0..4].copy_from_slice(&SIGNATURE.to_be_bytes());
                out[4..8].copy_from_slice(&self.block_size.to_be_bytes());
                out[8..16].copy_from_slice(&self.remote_update.to_be_bytes());
                out[16..24].copy_from_slice(&self.remote_size.to_be_bytes());
                out[24..28].copy_from_slice(&self.version.to_be_bytes());
            }
        }
        // 28..64 reserved, left zero
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> UdcResult<(Self, ByteOrder)> {
        let sig = [raw[0], raw[1], raw[2], raw[3]];
        let order = if u32::from_le_bytes(sig) == SIGNATURE {
            ByteOrder::Little
        } else if u32::from_be_bytes(sig) == SIGNATURE {
            ByteOrder::Big
        } else {
            return Err(UdcError::with_message(
                UdcErrorKind::Corrupt,
                format!("bad bitmap signature {:08x}", u32::from_le_bytes(sig)),
            ));
        };
        let u32_at = |at: usize| {
            let b = [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];
            match order {
                ByteOrder::Little => u32::from_le_bytes(b),
                ByteOrder::Big => u32::from_be_bytes(b),
            }
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            match order {
                ByteOrder::Little => u64::from_le_bytes(b),
                ByteOrder::Big => u64::from_be_bytes(b),
            }
        };
        let header = Self {
            block_size: u32_at(4),
            remote_update: u64_at(8),
            remote_size: u64_at(16),
            version: u32_at(24),
        };
        if header.block_size == 0 {
            return Err(UdcError::with_message(
                UdcErrorKind::Corrupt,
                "bitmap header has zero block size",
            ));
        }
        Ok((header, order))
    }
}

/// An open bitmap file.
#[derive(Debug)]
pub struct BitmapFile {
    path: PathBuf,
    file: File,
    header: BitmapHeader,
    order: ByteOrder,
}

impl BitmapFile {
    /// Open an existing bitmap. `Ok(None)` when the file is absent or too short to hold a
    /// header.
    pub fn open(path: impl AsRef<Path>) -> UdcResult<Option<Self>> {
        let path = path.as_ref();
        let opened = OpenOptions::new().read(true).write(true).open(path);
        let Some(file) = not_found_to_none(opened).map_err(map_io_err("open bitmap"))? else {
            return Ok(None);
        };
        let mut raw = [0u8; HEADER_LEN];
        let read = read_full_at(&file, &mut raw, 0).map_err(map_io_err("read bitmap header"))?;
        if read < HEADER_LEN {
            debug!(bitmap = %path.display(), read, "bitmap shorter than its header");
            return Ok(None);
        }
        let (header, order) = BitmapHeader::decode(&raw).map_err(|err| {
            UdcError::with_message(err.kind(), format!("{}: {}", path.display(), err.message()))
        })?;
        trace!(bitmap = %path.display(), ?header, ?order, "opened bitmap");
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            header,
            order,
        }))
    }

    /// Write a fresh little-endian bitmap with every bit clear, installing it by rename so
    /// readers never observe a half-written header.
    pub fn create(path: impl AsRef<Path>, header: BitmapHeader) -> UdcResult<Self> {
        let path = path.as_ref();
        let dir = path.parent().ok_or_else(|| {
            UdcError::with_message(
                UdcErrorKind::InvalidInput,
                format!("bitmap path {} has no parent", path.display()),
            )
        })?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".bitmap.")
            .tempfile_in(dir)
            .map_err(map_io_err("create temporary bitmap"))?;
        tmp.write_all(&header.encode(ByteOrder::Little))
            .map_err(map_io_err("write bitmap header"))?;
        let mut remaining = bits::byte_len(header.block_count()) as u64;
        let zero = [0u8; ZERO_CHUNK_LEN];
        while remaining > 0 {
            let len = remaining.min(ZERO_CHUNK_LEN as u64) as usize;
            tmp.write_all(&zero[..len])
                .map_err(map_io_err("write bitmap bits"))?;
            remaining -= len as u64;
        }
        tmp.as_file()
            .sync_all()
            .map_err(map_io_err("sync bitmap"))?;
        let file = tmp
            .persist(path)
            .map_err(|err| io_err("install bitmap", err.error))?;
        debug!(
            bitmap = %path.display(),
            version = header.version,
            blocks = header.block_count(),
            "created bitmap"
        );
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            order: ByteOrder::Little,
        })
    }

    pub fn header(&self) -> &BitmapHeader {
        &self.header
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the bitmap bytes covering blocks `[start_block, end_block)`. Returns the bytes
    /// and the block index of their first bit. Bytes missing from a truncated file read as
    /// clear.
    pub fn read_bits(&self, start_block: u64, end_block: u64) -> UdcResult<(Vec<u8>, u64)> {
        let end_block = end_block.min(self.header.block_count());
        let start_block = start_block.min(end_block);
        let byte_start = start_block / 8;
        let byte_end = end_block.div_ceil(8);
        let mut out = vec![0u8; (byte_end - byte_start) as usize];
        read_full_at(&self.file, &mut out, HEADER_LEN as u64 + byte_start)
            .map_err(map_io_err("read bitmap bits"))?;
        Ok((out, byte_start * 8))
    }

    /// Persist `bytes` as bitmap bytes starting at byte `byte_start` of the bit area.
    pub fn write_bits(&self, byte_start: u64, bytes: &[u8]) -> UdcResult<()> {
        write_all_at(&self.file, bytes, HEADER_LEN as u64 + byte_start)
            .map_err(map_io_err("write bitmap bits"))
    }

    /// Number of blocks currently marked present.
    pub fn count_cached(&self) -> UdcResult<u64> {
        let blocks = self.header.block_count();
        let (bytes, first) = self.read_bits(0, blocks)?;
        Ok(bits::count_range(&bytes, 0, blocks - first))
    }

    /// Bump the modification time, which marks the remote metadata as recently confirmed.
    pub fn touch(&self) -> UdcResult<()> {
        self.file
            .set_modified(SystemTime::now())
            .map_err(map_io_err("touch bitmap"))
    }
}

/// Read just the header of the bitmap at `path`.
pub fn read_header(path: impl AsRef<Path>) -> UdcResult<Option<BitmapHeader>> {
    Ok(BitmapFile::open(path)?.map(|bitmap| bitmap.header))
}

fn remove_if_present(path: &Path, op: &'static str) -> UdcResult<()> {
    not_found_to_none(fs::remove_file(path)).map_err(map_io_err(op))?;
    Ok(())
}

fn stale_reason(
    bitmap: &BitmapFile,
    remote: RemoteInfo,
    block_size: u32,
    sparse_len: Option<u64>,
) -> UdcResult<Option<&'static str>> {
    let header = bitmap.header();
    Ok(if header.remote_info() != remote {
        Some("remote changed")
    } else if header.block_size != block_size {
        Some("block size changed")
    } else if sparse_len.is_none() {
        Some("sparse data missing")
    } else if sparse_len == Some(0) && bitmap.count_cached()? > 0 {
        Some("sparse data empty")
    } else {
        None
    })
}

/// Open the entry's bitmap, rebuilding the entry when it no longer describes `remote`.
///
/// An entry is stale when the header's size or modification time differ from `remote`,
/// the block size changed, the sparse file is missing, or the sparse file is empty while
/// the bitmap claims cached blocks. Rebuilding removes the bitmap before the sparse file,
/// creates an empty sparse file, then installs a clear bitmap with the next version.
pub fn open_or_rebuild(
    paths: &CachePaths,
    remote: RemoteInfo,
    block_size: u32,
) -> UdcResult<BitmapFile> {
    let existing = BitmapFile::open(&paths.bitmap)?;
    let sparse_len = not_found_to_none(fs::metadata(&paths.sparse))
        .map_err(map_io_err("stat sparse data"))?
        .map(|meta| meta.len());

    let mut version = 0;
    if let Some(bitmap) = existing {
        let Some(reason) = stale_reason(&bitmap, remote, block_size, sparse_len)? else {
            return Ok(bitmap);
        };
        let header = bitmap.header();
        debug!(
            bitmap = %paths.bitmap.display(),
            reason,
            cached_size = header.remote_size,
            cached_update = header.remote_update,
            remote_size = remote.size,
            remote_update = remote.update_time,
            "cache entry stale; rebuilding"
        );
        version = header.version.wrapping_add(1);
    }

    remove_if_present(&paths.bitmap, "remove stale bitmap")?;
    remove_if_present(&paths.sparse, "remove stale sparse data")?;
    File::create(&paths.sparse).map_err(map_io_err("create sparse data"))?;
    BitmapFile::create(&paths.bitmap, BitmapHeader::new(block_size, remote, version))
}

/// Block indices in `[start_block, end_block)` whose bits are clear.
pub(crate) fn clear_blocks(
    bitmap: &BitmapFile,
    start_block: u64,
    end_block: u64,
) -> UdcResult<Vec<u64>> {
    let end_block = end_block.min(bitmap.header().block_count());
    if start_block >= end_block {
        return Ok(Vec::new());
    }
    let (bytes, first) = bitmap.read_bits(start_block, end_block)?;
    let limit = end_block - first;
    let mut missing = Vec::new();
    let mut idx = bits::find_clear(&bytes, start_block - first, limit);
    while idx < limit {
        let run_end = bits::find_set(&bytes, idx, limit);
        missing.extend((idx..run_end).map(|bit| bit + first));
        idx = bits::find_clear(&bytes, run_end, limit);
    }
    Ok(missing)
}
