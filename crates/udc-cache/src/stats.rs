use tracing::debug;

/// Counters for one kind of I/O.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub reads: u64,
    pub bytes_read: u64,
    pub writes: u64,
    pub bytes_written: u64,
}

impl IoCounters {
    pub fn record_read(&mut self, bytes: usize) {
        self.reads += 1;
        self.bytes_read += bytes as u64;
    }

    pub fn record_write(&mut self, bytes: usize) {
        self.writes += 1;
        self.bytes_written += bytes as u64;
    }
}

/// Per-handle I/O statistics, split by where the bytes went.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Bitmap file.
    pub bitmap: IoCounters,
    /// Sparse data file.
    pub sparse: IoCounters,
    /// Caller-facing reads on the handle.
    pub caller: IoCounters,
    /// Backend fetches.
    pub remote: IoCounters,
}

impl IoStats {
    /// Fraction of caller bytes that did not have to be fetched, in percent.
    pub fn hit_rate(&self) -> f64 {
        if self.caller.bytes_read == 0 {
            return 0.0;
        }
        let fetched = self.remote.bytes_read.min(self.caller.bytes_read);
        (1.0 - fetched as f64 / self.caller.bytes_read as f64) * 100.0
    }

    pub(crate) fn log(&self, url: &str) {
        debug!(
            %url,
            caller_reads = self.caller.reads,
            caller_bytes = self.caller.bytes_read,
            remote_reads = self.remote.reads,
            remote_bytes = self.remote.bytes_read,
            sparse_reads = self.sparse.reads,
            sparse_bytes_read = self.sparse.bytes_read,
            sparse_writes = self.sparse.writes,
            sparse_bytes_written = self.sparse.bytes_written,
            bitmap_reads = self.bitmap.reads,
            bitmap_writes = self.bitmap.writes,
            "udc file i/o"
        );
    }
}
