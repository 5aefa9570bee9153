//! Read-through block cache for remote files.
//!
//! Each cached URL maps to a directory under the cache root holding two files: a sparse
//! `sparseData` file with the remote bytes at their original offsets, and a `bitmap` file
//! recording which fixed-size blocks are present. [`UdcFile`] serves reads from the sparse
//! file, fetching only the missing block runs from the protocol backend, and rebuilds the
//! entry whenever the remote size or modification time changes.
//!
//! Several handles, in one process or many, may share an entry. There is no locking; a
//! version number in the bitmap header lets a handle notice that another one rebuilt the
//! entry underneath it.

mod fileio;

pub mod bitmap;
pub mod cleanup;
pub mod config;
pub mod file;
pub mod local;
pub mod path;
pub mod protocol;
pub mod stats;

pub use cleanup::cleanup;
pub use config::{SlowDelays, UdcConfig, default_cache_root};
pub use file::{
    UdcFile, cache_age, exists, is_local, read_all, remote_size, size_from_cache,
    time_from_cache,
};
pub use path::{CachePaths, cache_files, path_to_url};
pub use protocol::Protocol;
pub use stats::{IoCounters, IoStats};
pub use udc_core::{RemoteInfo, RemoteSource, UdcError, UdcErrorKind, UdcResult};
