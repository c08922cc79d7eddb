//! Timeout based freshness tracking.
//!
//! Keys start out stale, become fresh when seen and go stale again once the
//! time since the last sighting exceeds the timeout. Time is always passed in
//! so the tracker never reads a clock itself.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_seen: Option<Instant>,
    state: Liveness,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            last_seen: None,
            state: Liveness::Stale,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessTracker<K> {
    timeout: Duration,
    entries: HashMap<K, Entry>,
}

impl<K: Copy + Eq + Hash> LivenessTracker<K> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    /// Registers keys up front so they are reported as stale before their
    /// first sighting.
    pub fn with_keys(timeout: Duration, keys: impl IntoIterator<Item = K>) -> Self {
        let mut tracker = Self::new(timeout);
        for key in keys {
            tracker.entries.insert(key, Entry::default());
        }
        tracker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records a sighting. Returns true when the key was stale before.
    pub fn seen(&mut self, key: K, now: Instant) -> bool {
        let entry = self.entries.entry(key).or_default();
        entry.last_seen = Some(match entry.last_seen {
            // out of order timestamps never move the clock backwards
            Some(previous) if previous > now => previous,
            _ => now,
        });
        std::mem::replace(&mut entry.state, Liveness::Fresh) == Liveness::Stale
    }

    /// Moves every key whose last sighting is older than the timeout to stale
    /// and returns the keys that changed.
    pub fn poll(&mut self, now: Instant) -> Vec<K> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if entry.state == Liveness::Fresh && Self::expired(entry, now, timeout) {
                entry.state = Liveness::Stale;
                expired.push(*key);
            }
        }
        expired
    }

    fn expired(entry: &Entry, now: Instant, timeout: Duration) -> bool {
        match entry.last_seen {
            Some(last_seen) => now.saturating_duration_since(last_seen) > timeout,
            None => true,
        }
    }

    /// State as of the last `seen`/`poll`.
    pub fn state(&self, key: &K) -> Liveness {
        self.entries
            .get(key)
            .map_or(Liveness::Stale, |entry| entry.state)
    }

    pub fn is_fresh(&self, key: &K) -> bool {
        self.state(key) == Liveness::Fresh
    }

    pub fn last_seen(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).and_then(|entry| entry.last_seen)
    }

    /// Most recent sighting of any key.
    pub fn latest(&self) -> Option<Instant> {
        self.entries.values().filter_map(|entry| entry.last_seen).max()
    }

    pub fn all_fresh(&self) -> bool {
        !self.entries.is_empty()
            && self
                .entries
                .values()
                .all(|entry| entry.state == Liveness::Fresh)
    }
}
