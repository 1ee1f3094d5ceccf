//! In-memory index of a store's contents.
//!
//! The index tracks size, pin count and last use per artifact and decides
//! what to evict. It does no I/O, which keeps the eviction policy testable
//! on its own.

use hopper_core::Digest;
use hopper_core::artifact::RetentionPolicy;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    refs: u32,
    last_used: Instant,
}

#[derive(Debug, Default)]
pub struct StoreIndex {
    entries: HashMap<Digest, Entry>,
    total_bytes: u64,
}

impl StoreIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an artifact. Returns false if it was already present, in which
    /// case only its last-use time is refreshed.
    pub fn insert(&mut self, digest: Digest, size: u64, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(&digest) {
            entry.last_used = now;
            return false;
        }
        self.entries.insert(
            digest,
            Entry {
                size,
                refs: 0,
                last_used: now,
            },
        );
        self.total_bytes += size;
        true
    }

    pub fn size_of(&self, digest: &Digest) -> Option<u64> {
        self.entries.get(digest).map(|e| e.size)
    }

    pub fn touch(&mut self, digest: &Digest, now: Instant) -> bool {
        match self.entries.get_mut(digest) {
            Some(entry) => {
                entry.last_used = now;
                true
            }
            None => false,
        }
    }

    /// Take a pin. Returns false if the artifact is unknown.
    pub fn retain(&mut self, digest: &Digest, now: Instant) -> bool {
        match self.entries.get_mut(digest) {
            Some(entry) => {
                entry.refs += 1;
                entry.last_used = now;
                true
            }
            None => false,
        }
    }

    /// Drop a pin. Returns false if there was no pin to drop.
    pub fn release(&mut self, digest: &Digest, now: Instant) -> bool {
        match self.entries.get_mut(digest) {
            Some(entry) if entry.refs > 0 => {
                entry.refs -= 1;
                entry.last_used = now;
                true
            }
            _ => false,
        }
    }

    pub fn refs(&self, digest: &Digest) -> u32 {
        self.entries.get(digest).map(|e| e.refs).unwrap_or(0)
    }

    /// Forget an artifact. Pinned artifacts are never removed.
    pub fn remove(&mut self, digest: &Digest) -> Option<u64> {
        match self.entries.get(digest) {
            Some(entry) if entry.refs == 0 => {
                let size = entry.size;
                self.entries.remove(digest);
                self.total_bytes -= size;
                Some(size)
            }
            _ => None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.entries.keys()
    }

    /// Artifacts to evict, least recently used first, so that the store ends
    /// up under `policy.max_size_bytes`. Pinned artifacts and artifacts used
    /// within `policy.min_age` are skipped, so the result may not be enough
    /// to reach the target.
    pub fn eviction_candidates(&self, policy: &RetentionPolicy, now: Instant) -> Vec<(Digest, u64)> {
        if self.total_bytes <= policy.max_size_bytes {
            return Vec::new();
        }

        let mut evictable: Vec<(&Digest, &Entry)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0)
            .filter(|(_, e)| now.saturating_duration_since(e.last_used) >= policy.min_age)
            .collect();
        evictable.sort_by(|(da, a), (db, b)| a.last_used.cmp(&b.last_used).then(da.cmp(db)));

        let mut remaining = self.total_bytes;
        let mut victims = Vec::new();
        for (digest, entry) in evictable {
            if remaining <= policy.max_size_bytes {
                break;
            }
            remaining -= entry.size;
            victims.push((*digest, entry.size));
        }
        victims
    }
}
