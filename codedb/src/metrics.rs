use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Counters and timings for build and search runs.
///
/// One instance is created per command and handed by reference to the
/// components that record into it. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    // Build metrics
    files_indexed: Arc<AtomicU64>,
    bytes_indexed: Arc<AtomicU64>,
    chunks_written: Arc<AtomicU64>,
    compressed_bytes: Arc<AtomicU64>,
    compress_nanos: Arc<AtomicU64>,

    // Search metrics
    chunks_scanned: Arc<AtomicU64>,
    files_scanned: Arc<AtomicU64>,
    matches_found: Arc<AtomicU64>,
    decompress_nanos: Arc<AtomicU64>,
    scan_nanos: Arc<AtomicU64>,
    publish_waits: Arc<AtomicU64>,
}

impl Metrics {
    /// Creates a new Metrics instance
    pub fn new() -> Self {
        Self {
            files_indexed: Arc::new(AtomicU64::new(0)),
            bytes_indexed: Arc::new(AtomicU64::new(0)),
            chunks_written: Arc::new(AtomicU64::new(0)),
            compressed_bytes: Arc::new(AtomicU64::new(0)),
            compress_nanos: Arc::new(AtomicU64::new(0)),
            chunks_scanned: Arc::new(AtomicU64::new(0)),
            files_scanned: Arc::new(AtomicU64::new(0)),
            matches_found: Arc::new(AtomicU64::new(0)),
            decompress_nanos: Arc::new(AtomicU64::new(0)),
            scan_nanos: Arc::new(AtomicU64::new(0)),
            publish_waits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records one normalized file appended to the corpus
    pub fn record_file_indexed(&self, bytes: u64) {
        self.files_indexed.fetch_add(1, Ordering::Relaxed);
        self.bytes_indexed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one chunk compressed and appended to the container
    pub fn record_chunk_written(&self, compressed: u64, elapsed: Duration) {
        let total = self.chunks_written.fetch_add(1, Ordering::Relaxed) + 1;
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
        self.compress_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
        debug!("Chunk {} written: {} compressed bytes", total, compressed);
    }

    /// Records the compute phase of one scanned chunk
    pub fn record_chunk_scanned(
        &self,
        files: u64,
        matches: u64,
        decompress: Duration,
        scan: Duration,
    ) {
        self.chunks_scanned.fetch_add(1, Ordering::Relaxed);
        self.files_scanned.fetch_add(files, Ordering::Relaxed);
        self.matches_found.fetch_add(matches, Ordering::Relaxed);
        self.decompress_nanos
            .fetch_add(duration_nanos(decompress), Ordering::Relaxed);
        self.scan_nanos
            .fetch_add(duration_nanos(scan), Ordering::Relaxed);
    }

    /// Records a worker that had to wait for an earlier chunk to publish
    pub fn record_publish_wait(&self) {
        self.publish_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets a snapshot of all counters
    pub fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            files_indexed: self.files_indexed.load(Ordering::Relaxed),
            bytes_indexed: self.bytes_indexed.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
            compress_time: Duration::from_nanos(self.compress_nanos.load(Ordering::Relaxed)),
            chunks_scanned: self.chunks_scanned.load(Ordering::Relaxed),
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            matches_found: self.matches_found.load(Ordering::Relaxed),
            decompress_time: Duration::from_nanos(self.decompress_nanos.load(Ordering::Relaxed)),
            scan_time: Duration::from_nanos(self.scan_nanos.load(Ordering::Relaxed)),
            publish_waits: self.publish_waits.load(Ordering::Relaxed),
        }
    }

    /// Logs the current statistics
    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Corpus stats:\n\
             Files indexed: {} ({} bytes)\n\
             Chunks written: {} ({} compressed bytes, {})\n\
             Chunks scanned: {} ({} files, {} matches)\n\
             Decompress time: {}\n\
             Scan time: {}\n\
             Publish waits: {}",
            stats.files_indexed,
            stats.bytes_indexed,
            stats.chunks_written,
            stats.compressed_bytes,
            humantime::format_duration(stats.compress_time),
            stats.chunks_scanned,
            stats.files_scanned,
            stats.matches_found,
            humantime::format_duration(stats.decompress_time),
            humantime::format_duration(stats.scan_time),
            stats.publish_waits
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` and returns its result together with the elapsed time
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Snapshot of [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsStats {
    pub files_indexed: u64,
    pub bytes_indexed: u64,
    pub chunks_written: u64,
    pub compressed_bytes: u64,
    pub compress_time: Duration,
    pub chunks_scanned: u64,
    pub files_scanned: u64,
    pub matches_found: u64,
    pub decompress_time: Duration,
    pub scan_time: Duration,
    pub publish_waits: u64,
}
