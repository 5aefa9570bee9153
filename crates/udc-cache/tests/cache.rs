use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use udc_cache::{
    CachePaths, RemoteInfo, RemoteSource, UdcConfig, UdcError, UdcErrorKind, UdcFile, UdcResult,
    cache_age, read_all, size_from_cache, time_from_cache,
};

const URL: &str = "http://example.test/data/blob.bin";

fn data_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// In-memory remote that records every fetch it serves.
struct RecordingSource {
    data: Mutex<Vec<u8>>,
    update_time: AtomicUsize,
    info_requests: AtomicUsize,
    fetches: Mutex<Vec<(u64, usize)>>,
    fail: AtomicBool,
    truncate: AtomicBool,
}

impl RecordingSource {
    fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            update_time: AtomicUsize::new(1_700_000_000),
            info_requests: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            truncate: AtomicBool::new(false),
        })
    }

    fn take_fetches(&self) -> Vec<(u64, usize)> {
        std::mem::take(&mut *self.fetches.lock().expect("fetches lock"))
    }

    fn replace(&self, data: Vec<u8>, update_time: usize) {
        *self.data.lock().expect("data lock") = data;
        self.update_time.store(update_time, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSource for RecordingSource {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn fetch_info(&self, _url: &str) -> UdcResult<Option<RemoteInfo>> {
        self.info_requests.fetch_add(1, Ordering::SeqCst);
        let size = self.data.lock().expect("data lock").len() as u64;
        Ok(Some(RemoteInfo::new(
            size,
            self.update_time.load(Ordering::SeqCst) as u64,
        )))
    }

    async fn fetch_data(&self, _url: &str, offset: u64, buf: &mut [u8]) -> UdcResult<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UdcError::with_message(UdcErrorKind::Remote, "connection reset"));
        }
        self.fetches
            .lock()
            .expect("fetches lock")
            .push((offset, buf.len()));
        let data = self.data.lock().expect("data lock");
        let start = (offset as usize).min(data.len());
        let mut len = buf.len().min(data.len() - start);
        if self.truncate.load(Ordering::SeqCst) && len > 0 {
            len -= 1;
        }
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }
}

async fn open(source: &Arc<RecordingSource>, config: &UdcConfig) -> UdcFile {
    UdcFile::open_with_source(URL, source.clone(), config)
        .await
        .expect("open")
        .expect("remote exists")
}

#[tokio::test]
async fn fetches_only_missing_block_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let data = data_blob(100_000);
    let source = RecordingSource::new(data.clone());
    let mut file = open(&source, &config).await;
    assert_eq!(file.size(), 100_000);
    assert_eq!(file.bitmap_version(), 0);
    assert_eq!(file.known_good_window(), (0, 0));

    let mut buf = vec![0u8; 5000];
    assert_eq!(file.read(&mut buf).await.expect("read head"), 5000);
    assert_eq!(buf, data[..5000]);
    assert_eq!(source.take_fetches(), vec![(0, 8192)]);
    assert_eq!(file.known_good_window(), (0, 8192));

    file.seek(0);
    assert_eq!(file.read(&mut buf).await.expect("read head again"), 5000);
    assert!(source.take_fetches().is_empty());

    file.seek(70_000);
    let mut tail = vec![0u8; 40_000];
    assert_eq!(file.read(&mut tail).await.expect("read tail"), 30_000);
    assert_eq!(tail[..30_000], data[70_000..]);
    assert_eq!(source.take_fetches(), vec![(65_536, 100_000 - 65_536)]);
    assert_eq!(file.known_good_window(), (65_536, 100_000));
    assert_eq!(file.tell(), 100_000);

    assert_eq!(file.read(&mut buf).await.expect("read past end"), 0);
    assert!(source.take_fetches().is_empty());
    assert_eq!(file.check_cache_bits(0, 13).expect("bits"), vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(file.cached_blocks().expect("count"), 6);
    file.close();
}

#[tokio::test]
async fn reopened_entry_reuses_cached_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let data = data_blob(50_000);
    let source = RecordingSource::new(data.clone());

    let mut file = open(&source, &config).await;
    let mut buf = vec![0u8; 20_000];
    file.read_exact(&mut buf).await.expect("first read");
    assert_eq!(buf, data[..20_000]);
    assert_eq!(source.take_fetches(), vec![(0, 24_576)]);
    file.close();

    let mut file = open(&source, &config).await;
    assert_eq!(file.bitmap_version(), 0);
    assert_eq!(file.known_good_window(), (0, 24_576));
    file.seek(10_000);
    file.read_exact(&mut buf).await.expect("cached read");
    assert_eq!(buf, data[10_000..30_000]);
    assert_eq!(source.take_fetches(), vec![(24_576, 8192)]);
}

#[tokio::test]
async fn partially_cached_range_fetches_each_gap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path()).with_block_size(1024);
    let data = data_blob(10 * 1024);
    let source = RecordingSource::new(data.clone());
    let mut file = open(&source, &config).await;

    assert!(file.preload(2048, 1024).await.expect("preload block 2"));
    assert!(file.preload(5 * 1024, 2048).await.expect("preload blocks 5-6"));
    source.take_fetches();

    let mut all = vec![0u8; data.len()];
    file.read_exact(&mut all).await.expect("read all");
    assert_eq!(all, data);
    assert_eq!(
        source.take_fetches(),
        vec![(0, 2048), (3072, 2048), (7168, 3072)]
    );
    assert!(file.check_cache_bits(0, 10).expect("bits").is_empty());
}

#[tokio::test]
async fn large_reads_are_filled_in_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path())
        .with_block_size(1024)
        .with_max_fetch_bytes(4096);
    let data = data_blob(10_000);
    let source = RecordingSource::new(data.clone());
    let mut file = open(&source, &config).await;

    let mut all = vec![0u8; data.len()];
    assert_eq!(file.read(&mut all).await.expect("read"), data.len());
    assert_eq!(all, data);
    assert_eq!(
        source.take_fetches(),
        vec![(0, 4096), (4096, 4096), (8192, 10_000 - 8192)]
    );
    assert_eq!(file.known_good_window(), (0, 10_000));
}

#[tokio::test]
async fn remote_change_rebuilds_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let source = RecordingSource::new(data_blob(30_000));

    let mut file = open(&source, &config).await;
    let mut buf = vec![0u8; 30_000];
    file.read_exact(&mut buf).await.expect("read v0");
    file.close();
    source.take_fetches();

    let changed: Vec<u8> = data_blob(20_000).into_iter().map(|b| b ^ 0xff).collect();
    source.replace(changed.clone(), 1_700_000_100);
    let mut file = open(&source, &config).await;
    assert_eq!(file.bitmap_version(), 1);
    assert_eq!(file.size(), 20_000);
    assert_eq!(file.update_time(), 1_700_000_100);
    assert_eq!(file.known_good_window(), (0, 0));

    let mut buf = vec![0u8; 20_000];
    file.read_exact(&mut buf).await.expect("read v1");
    assert_eq!(buf, changed);
    assert_eq!(source.take_fetches(), vec![(0, 20_000)]);

    let paths = CachePaths::for_url(URL, dir.path()).expect("paths");
    let sparse_len = std::fs::metadata(&paths.sparse).expect("sparse").len();
    assert_eq!(sparse_len, 20_000);
}

#[tokio::test]
async fn rebuild_by_another_handle_soft_fails_reads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let source = RecordingSource::new(data_blob(40_000));

    let mut stale = open(&source, &config).await;
    source.replace(data_blob(41_000), 1_700_000_500);
    let fresh = open(&source, &config).await;
    assert_eq!(fresh.bitmap_version(), 1);

    stale.seek(100);
    let mut buf = vec![0u8; 1000];
    assert_eq!(stale.read(&mut buf).await.expect("soft failure"), 0);
    assert_eq!(stale.tell(), 100);
    assert!(source.take_fetches().is_empty());
    assert!(!stale.preload(0, 1000).await.expect("preload soft failure"));
}

#[tokio::test]
async fn recreated_entry_soft_fails_handles_on_the_removed_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let data = data_blob(20_000);
    let source = RecordingSource::new(data.clone());

    let mut stale = open(&source, &config).await;
    let entry_dir = stale.cache_dir().expect("cached").to_path_buf();
    std::fs::remove_dir_all(&entry_dir).expect("remove entry");
    let mut fresh = open(&source, &config).await;
    assert_eq!(stale.bitmap_version(), fresh.bitmap_version());

    let mut buf = [0u8; 8];
    fresh.seek(8192);
    fresh.read_exact(&mut buf).await.expect("fresh read");
    assert_eq!(&buf[..], &data[8192..8200]);

    assert_eq!(stale.read(&mut buf).await.expect("soft failure"), 0);
    assert_eq!(stale.tell(), 0);
    assert!(!stale.preload(0, 1000).await.expect("preload soft failure"));

    fresh.seek(0);
    fresh.read_exact(&mut buf).await.expect("fresh read");
    assert_eq!(&buf[..], &data[..8]);
    assert!(fresh.check_cache_bits(0, 1).expect("bits").is_empty());
}

#[tokio::test]
async fn missing_sparse_file_forces_rebuild() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let data = data_blob(9000);
    let source = RecordingSource::new(data.clone());

    let mut file = open(&source, &config).await;
    let mut buf = vec![0u8; 9000];
    file.read_exact(&mut buf).await.expect("read");
    file.close();

    let paths = CachePaths::for_url(URL, dir.path()).expect("paths");
    std::fs::remove_file(&paths.sparse).expect("remove sparse");
    source.take_fetches();

    let mut file = open(&source, &config).await;
    assert_eq!(file.bitmap_version(), 1);
    file.read_exact(&mut buf).await.expect("refetch");
    assert_eq!(buf, data);
    assert_eq!(source.take_fetches(), vec![(0, 9000)]);
}

#[tokio::test]
async fn fetch_errors_propagate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let source = RecordingSource::new(data_blob(10_000));
    let mut file = open(&source, &config).await;

    source.fail.store(true, Ordering::SeqCst);
    let mut buf = vec![0u8; 100];
    let err = file.read(&mut buf).await.expect_err("fetch fails");
    assert_eq!(err.kind(), UdcErrorKind::Remote);
    assert_eq!(file.tell(), 0);

    source.fail.store(false, Ordering::SeqCst);
    source.truncate.store(true, Ordering::SeqCst);
    let err = file.read(&mut buf).await.expect_err("short fetch");
    assert_eq!(err.kind(), UdcErrorKind::Remote);
    assert_eq!(file.check_cache_bits(0, 2).expect("bits"), vec![0, 1]);

    source.truncate.store(false, Ordering::SeqCst);
    assert_eq!(file.read(&mut buf).await.expect("recovered"), 100);
}

#[tokio::test]
async fn uncached_mode_always_fetches() {
    let config = UdcConfig::without_cache();
    let data = data_blob(5000);
    let source = RecordingSource::new(data.clone());
    let mut file = open(&source, &config).await;
    assert!(file.cache_dir().is_none());

    let mut buf = vec![0u8; 1000];
    for _ in 0..2 {
        file.seek(300);
        assert_eq!(file.read(&mut buf).await.expect("read"), 1000);
        assert_eq!(buf, data[300..1300]);
    }
    assert_eq!(source.take_fetches(), vec![(300, 1000), (300, 1000)]);
}

#[tokio::test]
async fn cache_timeout_skips_remote_info() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path()).with_cache_timeout(Duration::from_secs(3600));
    let source = RecordingSource::new(data_blob(12_000));

    open(&source, &config).await.close();
    assert_eq!(source.info_requests.load(Ordering::SeqCst), 1);

    source.replace(data_blob(13_000), 1_700_009_999);
    let file = open(&source, &config).await;
    assert_eq!(source.info_requests.load(Ordering::SeqCst), 1);
    assert_eq!(file.size(), 12_000);
    assert_eq!(file.bitmap_version(), 0);

    let strict = UdcConfig::new(dir.path());
    let file = open(&source, &strict).await;
    assert_eq!(source.info_requests.load(Ordering::SeqCst), 2);
    assert_eq!(file.size(), 13_000);
    assert_eq!(file.bitmap_version(), 1);
}

#[tokio::test]
async fn cache_metadata_is_queryable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = UdcConfig::new(dir.path());
    let source = RecordingSource::new(data_blob(777));

    assert_eq!(size_from_cache(URL, dir.path()).expect("size"), None);
    assert_eq!(cache_age(URL, dir.path()).expect("age"), None);

    let file = open(&source, &config).await;
    let cache_dir = file.cache_dir().expect("cache dir").to_path_buf();
    assert!(cache_dir.starts_with(dir.path()));
    file.close();

    assert_eq!(size_from_cache(URL, dir.path()).expect("size"), Some(777));
    assert_eq!(
        time_from_cache(URL, dir.path()).expect("time"),
        Some(1_700_000_000)
    );
    let age = cache_age(URL, dir.path()).expect("age").expect("cached");
    assert!(age < Duration::from_secs(60));
}

#[tokio::test]
async fn local_urls_round_trip_through_cache() {
    let cache = tempfile::tempdir().expect("cache dir");
    let remote = tempfile::tempdir().expect("remote dir");
    let path = remote.path().join("blob.bin");
    let data = data_blob(70_000);
    std::fs::write(&path, &data).expect("write remote");
    let url = format!("local:{}", path.display());
    let config = UdcConfig::new(cache.path());

    let mut file = UdcFile::open(&url, &config)
        .await
        .expect("open")
        .expect("exists");
    assert_eq!(file.protocol(), "local");
    file.seek(12_345);
    let mut buf = vec![0u8; 40_000];
    file.read_exact(&mut buf).await.expect("read");
    assert_eq!(buf, data[12_345..52_345]);
    assert!(file.cache_dir().expect("cached").join("sparseData").exists());

    let all = read_all(&url, &config, 0).await.expect("read all");
    assert_eq!(all, data);
    let err = read_all(&url, &config, 1000).await.expect_err("too large");
    assert_eq!(err.kind(), UdcErrorKind::TooLarge);

    let missing = format!("local:{}", remote.path().join("nope").display());
    assert!(UdcFile::open(&missing, &config).await.expect("open").is_none());
}

#[tokio::test]
async fn plain_paths_bypass_cache() {
    let cache = tempfile::tempdir().expect("cache dir");
    let remote = tempfile::tempdir().expect("remote dir");
    let path = remote.path().join("plain.txt");
    std::fs::write(&path, b"first line\nsecond line\nlast").expect("write");
    let config = UdcConfig::new(cache.path());
    let url = path.to_str().expect("utf-8 path");

    let mut file = UdcFile::open(url, &config)
        .await
        .expect("open")
        .expect("exists");
    assert_eq!(file.protocol(), "transparent");
    assert!(file.cache_dir().is_none());
    assert_eq!(file.read_line().await.expect("line").as_deref(), Some("first line"));
    assert_eq!(file.read_line().await.expect("line").as_deref(), Some("second line"));
    assert_eq!(file.read_line().await.expect("line").as_deref(), Some("last"));
    assert_eq!(file.read_line().await.expect("line"), None);
    assert_eq!(std::fs::read_dir(cache.path()).expect("cache").count(), 0);
}

#[tokio::test]
async fn typed_reads_decode_values() {
    let remote = tempfile::tempdir().expect("remote dir");
    let path = remote.path().join("typed.bin");
    let mut raw = Vec::new();
    raw.push(7u8);
    raw.extend_from_slice(&0x0102_0304u32.to_ne_bytes());
    raw.extend_from_slice(&0x0102_0304u32.swap_bytes().to_ne_bytes());
    raw.extend_from_slice(&0xbeefu16.to_ne_bytes());
    raw.extend_from_slice(&0x1122_3344_5566_7788u64.swap_bytes().to_ne_bytes());
    raw.extend_from_slice(&1.5f32.to_bits().to_ne_bytes());
    raw.extend_from_slice(&(-2.25f64).to_bits().swap_bytes().to_ne_bytes());
    raw.extend_from_slice(b"chr1\0");
    raw.push(5);
    raw.extend_from_slice(b"hello");
    raw.push(9);
    raw.extend_from_slice(b"short");
    std::fs::write(&path, &raw).expect("write");

    let cache = tempfile::tempdir().expect("cache dir");
    let config = UdcConfig::new(cache.path()).with_block_size(16);
    let url = format!("local:{}", path.display());
    let mut file = UdcFile::open(&url, &config)
        .await
        .expect("open")
        .expect("exists");

    assert_eq!(file.read_u8().await.expect("u8"), 7);
    assert_eq!(file.read_u32(false).await.expect("u32"), 0x0102_0304);
    assert_eq!(file.read_u32(true).await.expect("swapped u32"), 0x0102_0304);
    assert_eq!(file.read_u16(false).await.expect("u16"), 0xbeef);
    assert_eq!(
        file.read_u64(true).await.expect("swapped u64"),
        0x1122_3344_5566_7788
    );
    assert_eq!(file.read_f32(false).await.expect("f32"), 1.5);
    assert_eq!(file.read_f64(true).await.expect("swapped f64"), -2.25);
    assert_eq!(file.read_string_zero().await.expect("cstr"), "chr1");
    assert_eq!(
        file.read_short_string().await.expect("pstr").as_deref(),
        Some("hello")
    );
    let err = file.read_short_string().await.expect_err("truncated pstr");
    assert_eq!(err.kind(), UdcErrorKind::UnexpectedEof);
    assert_eq!(file.read_short_string().await.expect("eof"), None);
    let err = file.read_string_zero().await.expect_err("eof cstr");
    assert_eq!(err.kind(), UdcErrorKind::UnexpectedEof);

    file.seek(1);
    file.seek_cur(4).expect("forward");
    assert_eq!(file.tell(), 5);
    let err = file.seek_cur(-6).expect_err("before start");
    assert_eq!(err.kind(), UdcErrorKind::InvalidInput);
}

#[tokio::test]
async fn small_reads_share_one_sparse_read() {
    let cache = tempfile::tempdir().expect("cache dir");
    let remote = tempfile::tempdir().expect("remote dir");
    let path = remote.path().join("lines.txt");
    let text: String = (0..100).map(|i| format!("line {i}\n")).collect();
    std::fs::write(&path, &text).expect("write remote");
    let url = format!("local:{}", path.display());
    let config = UdcConfig::new(cache.path());

    let mut file = UdcFile::open(&url, &config)
        .await
        .expect("open")
        .expect("exists");
    assert!(file.preload(0, file.size()).await.expect("preload"));
    let before = file.io_stats().sparse.reads;

    let mut lines = Vec::new();
    while let Some(line) = file.read_line().await.expect("line") {
        lines.push(line);
    }
    assert_eq!(lines.len(), 100);
    assert_eq!(lines[42], "line 42");
    assert_eq!(file.io_stats().sparse.reads - before, 1);

    file.seek(0);
    assert_eq!(file.read_line().await.expect("line").as_deref(), Some("line 0"));
    assert_eq!(file.io_stats().sparse.reads - before, 2);
}
