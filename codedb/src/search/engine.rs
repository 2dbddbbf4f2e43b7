//! Concurrent, order-preserving search over a corpus container.
//!
//! A fixed pool of workers repeatedly claims the next compressed chunk,
//! decompresses and scans it in parallel with the other workers, then
//! publishes its output. Output reaches the sink strictly in chunk order, so
//! the result of a search is byte-identical for any pool size.
//!
//! # Scheduling
//!
//! All shared state lives behind one mutex:
//!
//! - the corpus reader, so claiming a chunk and assigning its sequence number
//!   happen together
//! - `next_due`, the sequence number whose output is written next
//! - a ring of `threads + 1` output slots indexed by `seq % capacity`
//! - the sink
//!
//! A worker only claims a new chunk after its previous output was handed off,
//! so at most `threads` sequence numbers are outstanding and the ring never
//! wraps onto a live slot. Each slot has its own condition variable. Whoever
//! publishes the chunk that is due drains every contiguous ready slot and
//! wakes their owners; everyone else waits on their own slot.

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::matcher::Matcher;
use super::scanner::{scan_file, FormatReceiver, MatchFormatter};
use crate::codec::decode;
use crate::corpus::{CompressedChunk, CorpusReader};
use crate::errors::{CodeDbError, CodeDbResult};
use crate::metrics::{timed, Metrics};

/// How often a waiting worker rechecks the cancel flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to look for, and in which files
#[derive(Debug)]
pub struct SearchQuery<'a, M: ?Sized> {
    /// Pattern searched in file bodies
    pub pattern: &'a M,
    /// Files whose full name has no match for this pattern are skipped
    pub file_filter: Option<&'a M>,
    /// Removed from the front of full names to form display names
    pub strip_prefix: &'a str,
}

impl<'a, M: ?Sized> SearchQuery<'a, M> {
    pub fn new(pattern: &'a M) -> Self {
        Self {
            pattern,
            file_filter: None,
            strip_prefix: "",
        }
    }

    pub fn with_file_filter(mut self, filter: &'a M) -> Self {
        self.file_filter = Some(filter);
        self
    }

    pub fn with_strip_prefix(mut self, prefix: &'a str) -> Self {
        self.strip_prefix = prefix;
        self
    }
}

/// Totals for one completed search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub chunks: u64,
    pub files_scanned: u64,
    pub matches: u64,
}

impl SearchStats {
    pub fn merge(&mut self, other: SearchStats) {
        self.chunks += other.chunks;
        self.files_scanned += other.files_scanned;
        self.matches += other.matches;
    }
}

/// A worker pool that runs ordered searches.
///
/// The pool is created once and reused for every search, including the
/// successive phases of a multi-pattern find. A search with N workers runs
/// N - 1 of them on pool threads and one on the calling thread.
pub struct SearchEngine {
    pool: Option<ThreadPool>,
    threads: usize,
    cancel: Arc<AtomicBool>,
    metrics: Metrics,
}

impl SearchEngine {
    pub fn new(threads: NonZeroUsize, metrics: Metrics) -> CodeDbResult<Self> {
        let pool = match threads.get() - 1 {
            0 => None,
            helpers => Some(
                ThreadPoolBuilder::new()
                    .num_threads(helpers)
                    .thread_name(|i| format!("codedb-search-{}", i))
                    .build()
                    .map_err(|e| CodeDbError::ThreadPool(e.to_string()))?,
            ),
        };
        debug!("Created search pool with {} workers", threads);

        Ok(Self {
            pool,
            threads: threads.get(),
            cancel: Arc::new(AtomicBool::new(false)),
            metrics,
        })
    }

    /// Number of workers in the pool
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Flag that stops a running search when set.
    ///
    /// A cancelled search returns [`CodeDbError::Cancelled`]; the flag stays
    /// set until [`SearchEngine::reset_cancel`] is called.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Searches every chunk of `reader` from the start, writing formatted
    /// matches to `sink` in corpus order.
    ///
    /// Everything published before a failure has already been written.
    pub fn search<M, F, W>(
        &self,
        reader: &mut CorpusReader,
        query: &SearchQuery<'_, M>,
        formatter: &F,
        sink: &mut W,
    ) -> CodeDbResult<SearchStats>
    where
        M: Matcher + Sync + ?Sized,
        F: MatchFormatter + ?Sized,
        W: Write + Send,
    {
        reader.rewind();
        info!("Searching {} with {} workers", reader.path().display(), self.threads);

        let capacity = self.threads + 1;
        let scheduler = Scheduler {
            state: Mutex::new(SchedulerState {
                reader,
                next_seq: 0,
                next_due: 0,
                slots: (0..capacity).map(|_| Slot::Free).collect(),
                sink,
                aborted: false,
            }),
            slot_ready: (0..capacity).map(|_| Condvar::new()).collect(),
            cancel: &self.cancel,
        };
        let worker = Worker {
            scheduler: &scheduler,
            query,
            formatter,
            metrics: &self.metrics,
        };

        let results = Mutex::new(Vec::with_capacity(self.threads));
        let run = || {
            let result = worker.run();
            results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(result);
        };
        match &self.pool {
            Some(pool) => pool.in_place_scope(|scope| {
                scope.spawn_broadcast(|_, _| run());
                run();
            }),
            None => run(),
        }
        let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);

        let mut stats = SearchStats::default();
        let mut failure = None;
        for result in results {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                // Report the root cause rather than a worker that stopped because of it
                Err(CodeDbError::Cancelled) => {
                    failure.get_or_insert(CodeDbError::Cancelled);
                }
                Err(e) => {
                    if matches!(failure, None | Some(CodeDbError::Cancelled)) {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            warn!("Search stopped: {}", e);
            return Err(e);
        }

        let mut state = scheduler.lock();
        debug_assert_eq!(state.next_due, state.next_seq);
        state.sink.flush()?;
        debug!(
            "Search finished: {} chunks, {} files, {} matches",
            stats.chunks, stats.files_scanned, stats.matches
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("threads", &self.threads)
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    Computing,
    Ready(Vec<u8>),
}

struct SchedulerState<'a, W> {
    reader: &'a mut CorpusReader,
    next_seq: u64,
    next_due: u64,
    slots: Vec<Slot>,
    sink: &'a mut W,
    aborted: bool,
}

struct Scheduler<'a, W> {
    state: Mutex<SchedulerState<'a, W>>,
    slot_ready: Vec<Condvar>,
    cancel: &'a AtomicBool,
}

impl<'a, W: Write> Scheduler<'a, W> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<'a, W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_index(&self, seq: u64) -> usize {
        (seq % self.slot_ready.len() as u64) as usize
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stops every worker; waiters are woken so they can observe it
    fn abort(&self, state: &mut SchedulerState<'a, W>) {
        if !state.aborted {
            state.aborted = true;
            for cv in &self.slot_ready {
                cv.notify_all();
            }
        }
    }

    /// Takes the next chunk and its sequence number, or `None` at the end
    fn claim(&self) -> CodeDbResult<Option<(u64, CompressedChunk)>> {
        let mut state = self.lock();
        if state.aborted || self.cancelled() {
            self.abort(&mut state);
            return Err(CodeDbError::Cancelled);
        }

        let chunk = match state.reader.next_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.abort(&mut state);
                return Err(e);
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let index = self.slot_index(seq);
        debug_assert!(matches!(state.slots[index], Slot::Free));
        state.slots[index] = Slot::Computing;
        trace!("Claimed chunk {} at offset {}", seq, chunk.offset());
        Ok(Some((seq, chunk)))
    }

    /// Stores the output of `seq` and returns once it has been written.
    ///
    /// Returns `true` if this worker had to wait for an earlier chunk.
    fn publish(&self, seq: u64, output: Vec<u8>) -> CodeDbResult<bool> {
        let index = self.slot_index(seq);
        let mut state = self.lock();
        if state.aborted {
            return Err(CodeDbError::Cancelled);
        }
        state.slots[index] = Slot::Ready(output);

        if state.next_due == seq {
            if let Err(e) = self.drain(&mut state) {
                self.abort(&mut state);
                return Err(e);
            }
            return Ok(false);
        }

        while state.next_due <= seq {
            if state.aborted || self.cancelled() {
                self.abort(&mut state);
                return Err(CodeDbError::Cancelled);
            }
            state = self.slot_ready[index]
                .wait_timeout(state, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(true)
    }

    /// Writes every contiguous ready slot starting at `next_due`
    fn drain(&self, state: &mut SchedulerState<'a, W>) -> CodeDbResult<()> {
        loop {
            let index = self.slot_index(state.next_due);
            let output = match std::mem::replace(&mut state.slots[index], Slot::Free) {
                Slot::Ready(output) => output,
                other => {
                    state.slots[index] = other;
                    return Ok(());
                }
            };
            state.sink.write_all(&output)?;
            trace!("Published chunk {} ({} bytes)", state.next_due, output.len());
            state.next_due += 1;
            self.slot_ready[index].notify_all();
        }
    }
}

struct Worker<'s, 'a, M: ?Sized, F: ?Sized, W> {
    scheduler: &'s Scheduler<'a, W>,
    query: &'s SearchQuery<'s, M>,
    formatter: &'s F,
    metrics: &'s Metrics,
}

impl<M, F, W> Worker<'_, '_, M, F, W>
where
    M: Matcher + ?Sized,
    F: MatchFormatter + ?Sized,
    W: Write,
{
    /// Claim, compute, publish until the corpus is exhausted
    fn run(&self) -> CodeDbResult<SearchStats> {
        let mut stats = SearchStats::default();
        while let Some((seq, chunk)) = self.scheduler.claim()? {
            let (output, chunk_stats) = match self.compute(&chunk) {
                Ok(done) => done,
                Err(e) => {
                    warn!("Chunk {} at offset {} failed: {}", seq, chunk.offset(), e);
                    let mut state = self.scheduler.lock();
                    self.scheduler.abort(&mut state);
                    return Err(e);
                }
            };
            stats.merge(chunk_stats);

            if self.scheduler.publish(seq, output)? {
                self.metrics.record_publish_wait();
            }
        }
        Ok(stats)
    }

    fn compute(&self, chunk: &CompressedChunk) -> CodeDbResult<(Vec<u8>, SearchStats)> {
        let (buffer, decompress_time) = timed(|| chunk.decompress());
        let buffer = buffer?;

        let (scanned, scan_time) = timed(|| self.scan(&buffer));
        let (output, stats) = scanned?;

        self.metrics.record_chunk_scanned(
            stats.files_scanned,
            stats.matches,
            decompress_time,
            scan_time,
        );
        Ok((output, stats))
    }

    fn scan(&self, buffer: &[u8]) -> CodeDbResult<(Vec<u8>, SearchStats)> {
        let mut output = Vec::new();
        let mut stats = SearchStats {
            chunks: 1,
            ..Default::default()
        };

        for file in decode(buffer)? {
            if let Some(filter) = self.query.file_filter {
                if !filter.is_match(file.name.as_bytes()) {
                    continue;
                }
            }
            stats.files_scanned += 1;

            let display_name = strip_display_prefix(file.name, self.query.strip_prefix);
            let mut receiver = FormatReceiver {
                formatter: self.formatter,
                out: &mut output,
            };
            let found = scan_file(buffer, &file, display_name, self.query.pattern, &mut receiver);
            stats.matches += found as u64;
        }
        Ok((output, stats))
    }
}

/// Removes `prefix` from the front of `name`, ignoring ASCII case
fn strip_display_prefix<'n>(name: &'n str, prefix: &str) -> &'n str {
    match name.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &name[prefix.len()..],
        _ => name,
    }
}
