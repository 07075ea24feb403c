//! Lifetime read-path counters.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Snapshot of the read cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from a resident line
    pub hits: u64,
    /// Requests that loaded a fraction into a line
    pub misses: u64,
    /// Requests read directly, bypassing the cache
    pub bypassed: u64,
    /// Chunk reads that failed or came back short
    pub io_errors: u64,
    /// Lines whose hash came back and was compared
    pub hash_checks: u64,
    /// Lines whose hash did not match
    pub hash_failures: u64,
    /// Re-reads of failed lines
    pub retries: u64,
    /// Retries that produced a matching hash
    pub recovered: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
    io_errors: AtomicU64,
    hash_checks: AtomicU64,
    hash_failures: AtomicU64,
    retries: AtomicU64,
    recovered: AtomicU64,
    failed_fractions: Mutex<BTreeMap<(u16, u32), u32>>,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn hit(&self) {
        bump(&self.hits);
    }

    pub fn miss(&self) {
        bump(&self.misses);
    }

    pub fn bypass(&self) {
        bump(&self.bypassed);
    }

    pub fn io_error(&self) {
        bump(&self.io_errors);
    }

    pub fn hash_checked(&self) {
        bump(&self.hash_checks);
    }

    pub fn retry(&self) {
        bump(&self.retries);
    }

    pub fn recovered(&self) {
        bump(&self.recovered);
    }

    pub fn hash_failed(&self, chunk: u16, fraction: u32) {
        bump(&self.hash_failures);
        *self
            .failed_fractions
            .lock()
            .entry((chunk, fraction))
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            hash_checks: self.hash_checks.load(Ordering::Relaxed),
            hash_failures: self.hash_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    /// Human-readable report of every load problem since the store opened.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        if stats.io_errors == 0 && stats.hash_failures == 0 {
            return "No pack file load errors.".to_string();
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Pack file load errors: {} I/O errors, {} hash mismatches in {} checks, {} retries ({} recovered)",
            stats.io_errors, stats.hash_failures, stats.hash_checks, stats.retries, stats.recovered
        );
        for (&(chunk, fraction), count) in self.failed_fractions.lock().iter() {
            let _ = writeln!(
                out,
                "  chunk {chunk:03} fraction {fraction}: {count} mismatch(es)"
            );
        }
        out
    }
}
