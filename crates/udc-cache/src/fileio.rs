use std::fs::{self, File};
use std::path::Path;

use udc_core::{UdcError, UdcErrorKind, UdcResult, io_err};

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

#[cfg(target_family = "unix")]
use std::os::unix::fs::MetadataExt;

#[cfg(target_family = "unix")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(out, offset)
}

#[cfg(target_family = "windows")]
fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(out, offset)
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.write_at(data, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.seek_write(data, offset)
}

/// Read until `out` is full or the file ends. Returns the number of bytes read.
pub(crate) fn read_full_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0usize;
    while filled < out.len() {
        let at = offset
            .checked_add(filled as u64)
            .ok_or_else(|| std::io::Error::other("read offset overflow"))?;
        match read_file_at(file, &mut out[filled..], at) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Read exactly `out.len()` bytes or fail with `op` as context.
pub(crate) fn read_exact_at(file: &File, out: &mut [u8], offset: u64, op: &str) -> UdcResult<()> {
    let read = read_full_at(file, out, offset).map_err(|err| io_err(op, err))?;
    if read != out.len() {
        return Err(UdcError::with_message(
            UdcErrorKind::Io,
            format!("{op}: short read at {offset} ({read} of {} bytes)", out.len()),
        ));
    }
    Ok(())
}

pub(crate) fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        let at = offset
            .checked_add(written as u64)
            .ok_or_else(|| std::io::Error::other("write offset overflow"))?;
        let count = write_file_at(file, &data[written..], at)?;
        if count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write cache file",
            ));
        }
        written += count;
    }
    Ok(())
}

pub(crate) fn map_io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> UdcError {
    move |err| io_err(op, err)
}

/// Treat `NotFound` as absence rather than failure.
pub(crate) fn not_found_to_none<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Whether `path` still names the open `file`. `Ok(false)` once the path is gone or has
/// been replaced by a different file.
#[cfg(target_family = "unix")]
pub(crate) fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    let Some(current) = not_found_to_none(fs::metadata(path))? else {
        return Ok(false);
    };
    let open = file.metadata()?;
    Ok(open.dev() == current.dev() && open.ino() == current.ino())
}

#[cfg(not(target_family = "unix"))]
pub(crate) fn same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(not_found_to_none(fs::metadata(path))?.is_some())
}
