use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy)]
pub struct DedupeConfig {
    /// How long a fingerprint suppresses repeats after it is first seen.
    pub window: Duration,
    /// Hard ceiling on tracked fingerprints, enforced by `sweep`.
    pub max_entries: usize,
    /// How far below `max_entries` a capacity eviction brings the cache.
    pub eviction_margin: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_entries: 10_000,
            eviction_margin: 1_000,
        }
    }
}

/// What a single `sweep` removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
}

/// A bounded, time-windowed set of recently seen fingerprints.
///
/// Entries keep their first-seen instant: a duplicate never extends its own window.
/// Each fingerprint is checked and recorded under its shard lock, so producers can
/// share one cache. Sweeping locks one shard at a time.
pub struct DedupeCache {
    seen: DashMap<Fingerprint, Instant>,
    config: DedupeConfig,
}

impl DedupeCache {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            seen: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    /// Record `fingerprint` and return true on first sight. Returns false, leaving the
    /// recorded instant untouched, if it was seen within the window.
    pub fn should_admit(&self, fingerprint: &Fingerprint) -> bool {
        self.should_admit_at(fingerprint, Instant::now())
    }

    pub fn should_admit_at(&self, fingerprint: &Fingerprint, now: Instant) -> bool {
        match self.seen.entry(fingerprint.clone()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.config.window {
                    false
                } else {
                    // Expired but not swept yet.
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Forget a fingerprint so the same occurrence can be admitted again.
    pub fn release(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.remove(fingerprint).is_some()
    }

    pub fn first_seen(&self, fingerprint: &Fingerprint) -> Option<Instant> {
        self.seen.get(fingerprint).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Instant::now())
    }

    /// Drop every entry older than the window, then, if the cache is still above
    /// `max_entries`, drop the oldest entries until it is `eviction_margin` below it.
    pub fn sweep_at(&self, now: Instant) -> SweepStats {
        let window = self.config.window;
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
        let expired = before.saturating_sub(self.seen.len());

        let mut evicted = 0;
        if self.seen.len() > self.config.max_entries {
            let target = self
                .config
                .max_entries
                .saturating_sub(self.config.eviction_margin);

            let mut entries: Vec<(Fingerprint, Instant)> = self
                .seen
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect();
            entries.sort_by_key(|(_, seen_at)| *seen_at);

            let excess = entries.len().saturating_sub(target);
            for (fingerprint, seen_at) in entries.into_iter().take(excess) {
                // Skip entries that were released and re-admitted since the snapshot.
                if self
                    .seen
                    .remove_if(&fingerprint, |_, current| *current == seen_at)
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }

        SweepStats {
            expired,
            evicted,
            remaining: self.seen.len(),
        }
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DedupeConfig::default())
    }
}
