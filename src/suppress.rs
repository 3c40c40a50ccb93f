//! Auto-reply duplicate suppression.
//!
//! Tracks which senders were recently answered so that a mail loop or a
//! chatty correspondent receives at most one automated response per
//! cooldown window. Entries live in memory only; a restart clears them.

use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};

/// The engine-owned suppression store.
#[derive(Debug)]
pub struct Suppressor {
    cooldown: Duration,
    entries: DashMap<String, Instant>,
}

impl Suppressor {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: DashMap::new(),
        }
    }

    /// Check whether `sender` is inside its cooldown window and, if not,
    /// start a new window. The check and the record are one atomic step,
    /// so two concurrent sessions for the same sender cannot both pass.
    ///
    /// Returns `true` when the sender is suppressed.
    pub fn check_and_record(&self, sender: &str) -> bool {
        let now = Instant::now();
        match self.entries.entry(sender.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    true
                } else {
                    occupied.insert(now + self.cooldown);
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + self.cooldown);
                false
            }
        }
    }

    /// Whether `sender` currently has an unexpired window.
    #[must_use]
    pub fn contains(&self, sender: &str) -> bool {
        self.entries
            .get(sender)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    /// Drop expired entries. Correctness never depends on this running;
    /// it only bounds memory between restarts.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
