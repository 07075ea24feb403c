//! Bounded read cache of 1 MiB chunk fractions.
//!
//! Every chunk read goes through [`ReadCache::read`]. A request inside one
//! fraction is served from a line, loading the fraction on a miss; a request
//! spanning fractions is read directly. Loaded lines are handed to the
//! [`HashDispatcher`] and reconciled later by [`ReadCache::check_md5_results`],
//! so verification never blocks a reader.
//!
//! Lock discipline: hits take the table's read lock, line state changes take
//! the write lock, and disk I/O happens with no cache lock held. A line in
//! [`LineState::Reading`] is owned by the thread filling it and is never
//! chosen as a victim.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};
use vpkstore_common::Md5Digest;

use crate::format::FRACTION_SIZE;
use crate::hasher::{HashDispatcher, HashRequest};
use crate::hashing::FractionTable;
use crate::io::FileProvider;
use crate::stats::{CacheStats, Counters};
use crate::tracker::FileTracker;

/// Consecutive mismatches after which a retried line is dropped.
pub(crate) const MAX_LINE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineState {
    Empty,
    Reading,
    /// Loaded; hash pending or unavailable.
    Resident,
    Verified,
    Failed,
}

struct CacheLine {
    chunk: u16,
    fraction: u32,
    data: Arc<[u8]>,
    state: LineState,
    last_used: AtomicU64,
    request: Option<HashRequest>,
    expected: Option<Md5Digest>,
    observed: Option<Md5Digest>,
    failures: u32,
    retrying: bool,
}

impl CacheLine {
    fn empty() -> Self {
        Self {
            chunk: 0,
            fraction: 0,
            data: Arc::from(Vec::new()),
            state: LineState::Empty,
            last_used: AtomicU64::new(0),
            request: None,
            expected: None,
            observed: None,
            failures: 0,
            retrying: false,
        }
    }

    #[inline]
    fn holds(&self, chunk: u16, fraction: u32) -> bool {
        self.state != LineState::Empty && self.chunk == chunk && self.fraction == fraction
    }

    #[inline]
    fn servable(&self) -> bool {
        matches!(self.state, LineState::Resident | LineState::Verified)
    }

    /// Clear the line, withdrawing any hash still owed to it.
    fn reset(&mut self, hasher: &dyn HashDispatcher) {
        if let Some(request) = self.request.take() {
            hasher.cancel(request);
        }
        *self = Self::empty();
    }
}

/// Chunk files plus the expected fraction hashes, borrowed from the store.
pub(crate) struct ChunkSource<'a> {
    pub trackers: &'a [FileTracker],
    pub provider: &'a dyn FileProvider,
    pub hashes: &'a FractionTable,
}

impl ChunkSource<'_> {
    fn read_at(&self, chunk: u16, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let tracker = self.trackers.get(chunk as usize).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no chunk file {chunk:03}"))
        })?;
        tracker.read_at(self.provider, offset, buf)
    }

    fn expected(&self, chunk: u16, fraction: u32) -> Option<Md5Digest> {
        self.hashes.lookup(chunk, fraction).map(|f| f.md5)
    }
}

enum Plan {
    Hit(usize),
    Fill(usize),
    Bypass,
}

pub(crate) struct ReadCache {
    lines: RwLock<Vec<CacheLine>>,
    clock: AtomicU64,
    hasher: Arc<dyn HashDispatcher>,
    counters: Counters,
}

impl ReadCache {
    pub fn new(lines: usize, hasher: Arc<dyn HashDispatcher>) -> Self {
        Self {
            lines: RwLock::new((0..lines).map(|_| CacheLine::empty()).collect()),
            clock: AtomicU64::new(0),
            hasher,
            counters: Counters::default(),
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read `buf.len()` bytes of `chunk` at `offset`.
    ///
    /// Returns the number of bytes copied. A short count means the chunk file
    /// is missing, failed or truncated; the failure is counted, never returned.
    pub fn read(&self, source: &ChunkSource<'_>, chunk: u16, offset: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let fraction = offset / FRACTION_SIZE;
        let last = (offset + buf.len() as u64 - 1) / FRACTION_SIZE;
        if fraction != last || fraction > u32::MAX as u64 {
            return self.read_direct(source, chunk, offset, buf);
        }
        let fraction = fraction as u32;
        let inner = (offset - fraction as u64 * FRACTION_SIZE) as usize;

        {
            let lines = self.lines.read();
            if let Some(line) = lines.iter().find(|l| l.servable() && l.holds(chunk, fraction)) {
                line.last_used.store(self.tick(), Ordering::Relaxed);
                self.counters.hit();
                return copy_out(&line.data, inner, buf);
            }
        }

        let slot = match self.plan_miss(chunk, fraction) {
            Plan::Hit(slot) => {
                let lines = self.lines.read();
                return copy_out(&lines[slot].data, inner, buf);
            }
            Plan::Fill(slot) => slot,
            Plan::Bypass => return self.read_direct(source, chunk, offset, buf),
        };

        self.counters.miss();
        match self.fill(source, slot, chunk, fraction) {
            Some(data) => {
                let n = copy_out(&data, inner, buf);
                if n < buf.len() {
                    self.counters.io_error();
                }
                n
            }
            None => 0,
        }
    }

    /// Recheck under the write lock and claim a line for filling.
    fn plan_miss(&self, chunk: u16, fraction: u32) -> Plan {
        let mut lines = self.lines.write();

        if let Some(slot) = lines.iter().position(|l| l.holds(chunk, fraction)) {
            let line = &mut lines[slot];
            match line.state {
                LineState::Resident | LineState::Verified => {
                    line.last_used.store(self.tick(), Ordering::Relaxed);
                    self.counters.hit();
                    return Plan::Hit(slot);
                }
                LineState::Reading => return Plan::Bypass,
                LineState::Failed | LineState::Empty => {
                    line.state = LineState::Reading;
                    return Plan::Fill(slot);
                }
            }
        }

        let victim = lines
            .iter()
            .position(|l| l.state == LineState::Empty)
            .or_else(|| {
                lines
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.state != LineState::Reading)
                    .min_by_key(|(_, l)| l.last_used.load(Ordering::Relaxed))
                    .map(|(i, _)| i)
            });

        let Some(slot) = victim else {
            trace!(chunk, fraction, "every cache line is loading, reading directly");
            return Plan::Bypass;
        };

        let line = &mut lines[slot];
        if line.state != LineState::Empty {
            debug!(
                chunk,
                fraction,
                evicted_chunk = line.chunk,
                evicted_fraction = line.fraction,
                "evicting cache line"
            );
        }
        line.reset(self.hasher.as_ref());
        line.chunk = chunk;
        line.fraction = fraction;
        line.state = LineState::Reading;
        Plan::Fill(slot)
    }

    /// Load a claimed line. Returns the loaded bytes, or `None` on I/O failure.
    fn fill(&self, source: &ChunkSource<'_>, slot: usize, chunk: u16, fraction: u32) -> Option<Arc<[u8]>> {
        let mut raw = vec![0u8; FRACTION_SIZE as usize];
        let start = fraction as u64 * FRACTION_SIZE;
        let result = source.read_at(chunk, start, &mut raw);

        let mut lines = self.lines.write();
        let line = &mut lines[slot];

        let n = match result {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                warn!(chunk, fraction, "chunk fraction is past end of file");
                self.counters.io_error();
                line.reset(self.hasher.as_ref());
                return None;
            }
            Err(e) => {
                warn!(chunk, fraction, error = %e, "chunk read failed");
                self.counters.io_error();
                line.reset(self.hasher.as_ref());
                return None;
            }
        };

        raw.truncate(n);
        let data: Arc<[u8]> = Arc::from(raw);
        let expected = source.expected(chunk, fraction);

        line.data = Arc::clone(&data);
        line.state = LineState::Resident;
        line.last_used.store(self.tick(), Ordering::Relaxed);
        line.expected = expected;
        line.observed = None;
        if let Some(stale) = line.request.take() {
            self.hasher.cancel(stale);
        }
        line.request = expected.map(|_| self.hasher.submit(Arc::clone(&data)));

        Some(data)
    }

    fn read_direct(&self, source: &ChunkSource<'_>, chunk: u16, offset: u64, buf: &mut [u8]) -> usize {
        self.counters.bypass();
        match source.read_at(chunk, offset, buf) {
            Ok(n) => {
                if n < buf.len() {
                    warn!(chunk, offset, wanted = buf.len(), got = n, "short chunk read");
                    self.counters.io_error();
                }
                n
            }
            Err(e) => {
                warn!(chunk, offset, error = %e, "direct chunk read failed");
                self.counters.io_error();
                0
            }
        }
    }

    /// Collect finished hashes and compare them. Returns the number of new failures.
    pub fn check_md5_results(&self) -> usize {
        let mut lines = self.lines.write();
        let mut failed = 0;

        for line in lines.iter_mut() {
            if line.state != LineState::Resident {
                continue;
            }
            let Some(request) = line.request else {
                continue;
            };
            let Some(digest) = self.hasher.poll(request) else {
                continue;
            };

            line.request = None;
            line.observed = Some(digest);
            self.counters.hash_checked();

            if Some(digest) == line.expected {
                if line.retrying {
                    debug!(chunk = line.chunk, fraction = line.fraction, "retried line verified");
                    self.counters.recovered();
                }
                line.state = LineState::Verified;
                line.failures = 0;
                line.retrying = false;
            } else {
                warn!(
                    chunk = line.chunk,
                    fraction = line.fraction,
                    expected = ?line.expected,
                    observed = %digest,
                    "cache line hash mismatch"
                );
                line.state = LineState::Failed;
                line.failures += 1;
                self.counters.hash_failed(line.chunk, line.fraction);
                failed += 1;
            }
        }

        failed
    }

    /// Slots currently marked failed.
    pub fn failed_lines(&self) -> Vec<usize> {
        self.lines
            .read()
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == LineState::Failed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Re-read one failed line and resubmit it for hashing.
    ///
    /// Returns whether a re-read was issued. A line that has failed
    /// [`MAX_LINE_RETRIES`] times in a row is dropped instead.
    pub fn retry_bad_cache_line(&self, source: &ChunkSource<'_>, slot: usize) -> bool {
        let (chunk, fraction) = {
            let mut lines = self.lines.write();
            let Some(line) = lines.get_mut(slot) else {
                return false;
            };
            if line.state != LineState::Failed {
                return false;
            }
            if line.failures >= MAX_LINE_RETRIES {
                warn!(
                    chunk = line.chunk,
                    fraction = line.fraction,
                    failures = line.failures,
                    "giving up on cache line"
                );
                line.reset(self.hasher.as_ref());
                return false;
            }
            line.state = LineState::Reading;
            line.retrying = true;
            (line.chunk, line.fraction)
        };

        debug!(chunk, fraction, "retrying failed cache line");
        self.counters.retry();
        self.fill(source, slot, chunk, fraction).is_some()
    }

    /// Retry every failed line. Returns the number of re-reads issued.
    pub fn retry_all_bad_cache_lines(&self, source: &ChunkSource<'_>) -> usize {
        self.failed_lines()
            .into_iter()
            .filter(|&slot| self.retry_bad_cache_line(source, slot))
            .count()
    }

    /// Drop every line of a chunk whose contents changed.
    pub fn invalidate_chunk(&self, chunk: u16) {
        for line in self.lines.write().iter_mut() {
            if line.state != LineState::Reading && line.state != LineState::Empty && line.chunk == chunk {
                line.reset(self.hasher.as_ref());
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub fn summary(&self) -> String {
        self.counters.summary()
    }

    #[cfg(test)]
    pub(crate) fn resident_keys(&self) -> Vec<(u16, u32, LineState)> {
        let mut keys: Vec<_> = self
            .lines
            .read()
            .iter()
            .filter(|l| l.state != LineState::Empty)
            .map(|l| (l.chunk, l.fraction, l.state))
            .collect();
        keys.sort_by_key(|&(c, f, _)| (c, f));
        keys
    }
}

fn copy_out(data: &[u8], inner: usize, buf: &mut [u8]) -> usize {
    if inner >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - inner);
    buf[..n].copy_from_slice(&data[inner..inner + n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::ImmediateHasher;
    use crate::hashing::hash_buffer;
    use crate::testing::{pattern, MemoryProvider};
    use std::path::PathBuf;

    const MIB: usize = FRACTION_SIZE as usize;

    struct Fixture {
        data: Vec<u8>,
        provider: MemoryProvider,
        trackers: Vec<FileTracker>,
        hashes: FractionTable,
        cache: ReadCache,
    }

    impl Fixture {
        fn new(fractions: usize) -> Self {
            let data = pattern(fractions * MIB, 3);
            let provider = MemoryProvider::new();
            provider.insert("c0", data.clone());
            let mut hashes = FractionTable::new();
            hashes.replace_chunk(0, hash_buffer(0, &data));
            Self {
                data,
                provider,
                trackers: vec![FileTracker::new(0, PathBuf::from("c0"))],
                hashes,
                cache: ReadCache::new(8, Arc::new(ImmediateHasher::new())),
            }
        }

        fn source(&self) -> ChunkSource<'_> {
            ChunkSource {
                trackers: &self.trackers,
                provider: &self.provider,
                hashes: &self.hashes,
            }
        }

        fn read(&self, offset: usize, len: usize) -> Vec<u8> {
            let mut buf = vec![0u8; len];
            let n = self.cache.read(&self.source(), 0, offset as u64, &mut buf);
            buf.truncate(n);
            buf
        }

        fn corrupt_expected(&mut self, fraction: u32) {
            let mut fractions = self.hashes.chunk(0).to_vec();
            fractions[fraction as usize].md5 = Md5Digest::compute(b"not this");
            self.hashes.replace_chunk(0, fractions);
        }
    }

    #[test]
    fn test_same_fraction_reads_once() {
        let fx = Fixture::new(2);
        assert_eq!(fx.read(10, 100), &fx.data[10..110]);
        let reads = fx.provider.reads();
        assert_eq!(fx.read(500, 100), &fx.data[500..600]);
        assert_eq!(fx.provider.reads(), reads);

        let stats = fx.cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let fx = Fixture::new(9);
        for f in 0..8 {
            fx.read(f * MIB, 16);
        }
        fx.read(0, 16);
        fx.read(8 * MIB, 16);

        let keys: Vec<u32> = fx.cache.resident_keys().iter().map(|k| k.1).collect();
        assert_eq!(keys, vec![0, 2, 3, 4, 5, 6, 7, 8]);

        let reads = fx.provider.reads();
        assert_eq!(fx.read(MIB + 1, 8), &fx.data[MIB + 1..MIB + 9]);
        assert_eq!(fx.provider.reads(), reads + 1);
    }

    #[test]
    fn test_evicted_lines_release_their_hashes() {
        let mut fx = Fixture::new(16);
        let hasher = Arc::new(ImmediateHasher::new());
        fx.cache = ReadCache::new(8, hasher.clone());

        for round in 0..4 {
            for f in 0..16 {
                fx.read(f * MIB + round, 8);
            }
            assert!(hasher.outstanding() <= 8, "round {round}: {}", hasher.outstanding());
        }

        fx.cache.invalidate_chunk(0);
        assert_eq!(hasher.outstanding(), 0);
        assert_eq!(fx.cache.check_md5_results(), 0);
    }

    #[test]
    fn test_spanning_read_bypasses() {
        let fx = Fixture::new(2);
        assert_eq!(fx.read(MIB - 10, 20), &fx.data[MIB - 10..MIB + 10]);
        assert!(fx.cache.resident_keys().is_empty());
        assert_eq!(fx.cache.stats().bypassed, 1);
    }

    #[test]
    fn test_verification_is_out_of_band() {
        let fx = Fixture::new(1);
        fx.read(0, 4);
        assert_eq!(fx.cache.resident_keys(), vec![(0, 0, LineState::Resident)]);
        assert_eq!(fx.cache.check_md5_results(), 0);
        assert_eq!(fx.cache.resident_keys(), vec![(0, 0, LineState::Verified)]);
        assert_eq!(fx.cache.stats().hash_checks, 1);
    }

    #[test]
    fn test_mismatch_marks_failed_and_retry_recovers() {
        let mut fx = Fixture::new(1);
        fx.corrupt_expected(0);

        // Reads are served before verification completes.
        assert_eq!(fx.read(0, 32), &fx.data[..32]);
        assert_eq!(fx.cache.check_md5_results(), 1);
        assert_eq!(fx.cache.failed_lines(), vec![0]);
        assert!(fx.cache.summary().contains("chunk 000 fraction 0"));

        fx.hashes.replace_chunk(0, hash_buffer(0, &fx.data));
        assert_eq!(fx.cache.retry_all_bad_cache_lines(&fx.source()), 1);
        fx.cache.check_md5_results();

        assert!(fx.cache.failed_lines().is_empty());
        let stats = fx.cache.stats();
        assert_eq!((stats.retries, stats.recovered, stats.hash_failures), (1, 1, 1));
    }

    #[test]
    fn test_failed_line_not_served_as_hit() {
        let mut fx = Fixture::new(1);
        fx.corrupt_expected(0);
        fx.read(0, 8);
        fx.cache.check_md5_results();

        let reads = fx.provider.reads();
        assert_eq!(fx.read(8, 8), &fx.data[8..16]);
        assert_eq!(fx.provider.reads(), reads + 1);
    }

    #[test]
    fn test_persistent_mismatch_is_dropped() {
        let mut fx = Fixture::new(1);
        fx.corrupt_expected(0);
        fx.read(0, 8);
        fx.cache.check_md5_results();

        for _ in 1..MAX_LINE_RETRIES {
            assert!(fx.cache.retry_bad_cache_line(&fx.source(), 0));
            assert_eq!(fx.cache.check_md5_results(), 1);
        }
        assert!(!fx.cache.retry_bad_cache_line(&fx.source(), 0));
        assert!(fx.cache.resident_keys().is_empty());
        assert_eq!(fx.cache.stats().hash_failures, MAX_LINE_RETRIES as u64);
    }

    #[test]
    fn test_missing_chunk_is_a_short_read() {
        let fx = Fixture::new(1);
        let mut buf = [0u8; 16];
        assert_eq!(fx.cache.read(&fx.source(), 4, 0, &mut buf), 0);
        assert_eq!(fx.cache.stats().io_errors, 1);
        assert!(fx.cache.resident_keys().is_empty());
    }

    #[test]
    fn test_invalidate_chunk() {
        let fx = Fixture::new(2);
        fx.read(0, 1);
        fx.read(MIB, 1);
        fx.cache.invalidate_chunk(0);
        assert!(fx.cache.resident_keys().is_empty());
    }
}
