//! Asynchronous MD5 dispatch for freshly read cache lines.
//!
//! The read cache hands each block it loads to a [`HashDispatcher`] and polls
//! for the digest later; nothing on the read path waits for a result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use vpkstore_common::Md5Digest;

/// Tag identifying one submitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashRequest(pub u64);

/// Submit-and-poll MD5 service.
pub trait HashDispatcher: Send + Sync {
    /// Queue a block for hashing.
    fn submit(&self, data: Arc<[u8]>) -> HashRequest;

    /// Take the digest of a finished request.
    ///
    /// Returns `None` while the request is still running. A digest is
    /// returned at most once.
    fn poll(&self, request: HashRequest) -> Option<Md5Digest>;

    /// Give up on a request. Its digest, finished or not, is discarded.
    fn cancel(&self, request: HashRequest);
}

/// Hashes blocks on the rayon thread pool.
///
/// Workers report `(tag, digest)` pairs over a channel; `poll` drains the
/// channel into a completion map before answering. Only tags that are still
/// wanted are kept.
pub struct ThreadPoolHasher {
    next: AtomicU64,
    sender: Sender<(u64, Md5Digest)>,
    receiver: Receiver<(u64, Md5Digest)>,
    completed: Mutex<Completions>,
}

#[derive(Default)]
struct Completions {
    digests: FxHashMap<u64, Md5Digest>,
    cancelled: FxHashSet<u64>,
}

impl Completions {
    fn drain(&mut self, receiver: &Receiver<(u64, Md5Digest)>) {
        for (id, digest) in receiver.try_iter() {
            if !self.cancelled.remove(&id) {
                self.digests.insert(id, digest);
            }
        }
    }
}

impl ThreadPoolHasher {
    /// Create a hasher on the global rayon pool.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            next: AtomicU64::new(1),
            sender,
            receiver,
            completed: Mutex::new(Completions::default()),
        }
    }
}

impl Default for ThreadPoolHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl HashDispatcher for ThreadPoolHasher {
    fn submit(&self, data: Arc<[u8]>) -> HashRequest {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let sender = self.sender.clone();
        rayon::spawn(move || {
            let digest = Md5Digest::compute(&data);
            sender.send((id, digest)).ok();
        });
        HashRequest(id)
    }

    fn poll(&self, request: HashRequest) -> Option<Md5Digest> {
        let mut completed = self.completed.lock();
        completed.drain(&self.receiver);
        completed.digests.remove(&request.0)
    }

    fn cancel(&self, request: HashRequest) {
        let mut completed = self.completed.lock();
        completed.drain(&self.receiver);
        if completed.digests.remove(&request.0).is_none() {
            completed.cancelled.insert(request.0);
        }
    }
}

/// Hashes synchronously inside `submit`.
///
/// Deterministic; used by tests and offline tooling.
#[derive(Default)]
pub struct ImmediateHasher {
    next: AtomicU64,
    completed: Mutex<FxHashMap<u64, Md5Digest>>,
}

impl ImmediateHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digests submitted but neither polled nor cancelled.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.completed.lock().len()
    }
}

impl HashDispatcher for ImmediateHasher {
    fn submit(&self, data: Arc<[u8]>) -> HashRequest {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.completed.lock().insert(id, Md5Digest::compute(&data));
        HashRequest(id)
    }

    fn poll(&self, request: HashRequest) -> Option<Md5Digest> {
        self.completed.lock().remove(&request.0)
    }

    fn cancel(&self, request: HashRequest) {
        self.completed.lock().remove(&request.0);
    }
}
