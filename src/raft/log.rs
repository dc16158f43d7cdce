//! The replicated log: a 1-indexed sequence of entries with a discardable snapshot prefix.
//!
//! Entry 0 of the backing `Vec` is always a sentinel sitting at `start_index`, carrying the
//! term of the last snapshotted entry (or term 0 / index 0 before any snapshot). Real entries
//! occupy slots `1..`.

use super::rpc::LogEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftLog {
    start_index: u64,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            start_index: 0,
            entries: vec![LogEntry {
                term: 0,
                command: Vec::new(),
            }],
        }
    }

    /// Rebuild a log whose prefix up to `last_included_index` has been compacted away,
    /// as happens on the follower side of an `InstallSnapshot`.
    pub fn from_snapshot(last_included_index: u64, last_included_term: u64) -> Self {
        Self {
            start_index: last_included_index,
            entries: vec![LogEntry {
                term: last_included_term,
                command: Vec::new(),
            }],
        }
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index < self.start_index {
            return None;
        }
        let slot = (index - self.start_index) as usize;
        if slot >= self.entries.len() {
            None
        } else {
            Some(slot)
        }
    }

    pub fn first_index(&self) -> u64 {
        self.start_index
    }

    pub fn last_index(&self) -> u64 {
        self.start_index + (self.entries.len() as u64 - 1)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().expect("log always has a sentinel").term
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.slot(index).map(|s| &self.entries[s])
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|e| e.term)
    }

    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    /// Clone of every entry from `index` to the end of the live suffix, for building an
    /// AppendEntries payload. Empty if `index` is past the end.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        match self.slot(index) {
            Some(slot) => self.entries[slot..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Delete every live entry at index `>= from` and append `new_entries` in their place.
    /// `from` must be `> first_index()` (the sentinel itself is never replaced this way).
    pub fn replace_from(&mut self, from: u64, new_entries: &[LogEntry]) {
        debug_assert!(from > self.start_index);
        let slot = (from - self.start_index) as usize;
        self.entries.truncate(slot.min(self.entries.len()));
        self.entries.extend_from_slice(new_entries);
    }

    /// Drop every entry with index `< through`; the entry that was at `through` becomes the
    /// new sentinel. No-op if `through <= first_index()`.
    pub fn trim_through(&mut self, through: u64) {
        if through <= self.start_index {
            return;
        }
        match self.slot(through) {
            Some(slot) => {
                let term = self.entries[slot].term;
                self.entries.drain(0..slot);
                self.start_index = through;
                self.entries[0] = LogEntry {
                    term,
                    command: Vec::new(),
                };
            }
            None => {
                // `through` is beyond our last index; this only happens when installing a
                // snapshot that is newer than anything we have, which callers handle by
                // rebuilding via `from_snapshot` instead of calling `trim_through`.
            }
        }
    }

    /// The first index (relative to `start`) at which `new_entries` actually disagrees with
    /// what's already in the log, i.e. the point from which `replace_from` should be called.
    /// Returns `start + new_entries.len()` if every entry already matches (a strict prefix).
    pub fn first_divergence(&self, start: u64, new_entries: &[LogEntry]) -> u64 {
        let mut index = start;
        for entry in new_entries {
            match self.entry(index) {
                Some(existing) if existing.term == entry.term => index += 1,
                _ => break,
            }
        }
        index
    }

    /// Fast-backup conflict locator: the first index of the highest term strictly below
    /// `prev_term`, searching backward from `min(prev_index, last_index())`. Never returns a
    /// value below `first_index() + 1`.
    pub fn locate_conflict(&self, prev_term: u64, prev_index: u64) -> u64 {
        let floor = self.first_index() + 1;
        let mut index = prev_index.min(self.last_index());

        let x_term = loop {
            if index <= self.first_index() {
                return floor;
            }
            match self.entry(index) {
                Some(e) if e.term < prev_term => break e.term,
                Some(_) => index -= 1,
                None => return floor,
            }
        };

        while index > self.first_index() {
            match self.entry(index - 1) {
                Some(e) if e.term == x_term => index -= 1,
                _ => break,
            }
        }
        index.max(floor)
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64) -> LogEntry {
        LogEntry {
            term,
            command: Vec::new(),
        }
    }

    #[test]
    fn fresh_log_has_sentinel_only() {
        let log = RaftLog::new();
        assert_eq!(log.first_index(), 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.entry(1).is_none());
    }

    #[test]
    fn append_advances_last_index() {
        let mut log = RaftLog::new();
        assert_eq!(log.append(entry(1)), 1);
        assert_eq!(log.append(entry(1)), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn replace_from_truncates_and_extends() {
        let mut log = RaftLog::new();
        log.append(entry(1));
        log.append(entry(1));
        log.append(entry(2));
        log.replace_from(2, &[entry(3), entry(3)]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.entry(1).unwrap().term, 1);
        assert_eq!(log.entry(2).unwrap().term, 3);
        assert_eq!(log.entry(3).unwrap().term, 3);
    }

    #[test]
    fn first_divergence_does_not_shrink_on_matching_prefix() {
        let mut log = RaftLog::new();
        log.append(entry(1));
        log.append(entry(2));
        log.append(entry(2));
        // A stale, duplicate AppendEntries re-sending a prefix that already matches.
        let incoming = vec![entry(1), entry(2)];
        let divergence = log.first_divergence(1, &incoming);
        assert_eq!(divergence, 3); // matched through index 2, nothing to replace
        assert_eq!(log.last_index(), 3); // untouched
    }

    #[test]
    fn first_divergence_finds_real_conflict() {
        let mut log = RaftLog::new();
        log.append(entry(1));
        log.append(entry(2));
        let incoming = vec![entry(1), entry(5)];
        let divergence = log.first_divergence(1, &incoming);
        assert_eq!(divergence, 2);
        log.replace_from(divergence, &incoming[(divergence - 1) as usize..]);
        assert_eq!(log.entry(2).unwrap().term, 5);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn trim_through_installs_new_sentinel() {
        let mut log = RaftLog::new();
        log.append(entry(1));
        log.append(entry(2));
        log.append(entry(3));
        log.trim_through(2);
        assert_eq!(log.first_index(), 2);
        assert_eq!(log.entry(2).unwrap().term, 2);
        assert!(log.entry(1).is_none());
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn locate_conflict_never_returns_below_floor() {
        let log = RaftLog::new();
        assert_eq!(log.locate_conflict(5, 0), 1);
    }

    #[test]
    fn locate_conflict_skips_whole_term() {
        let mut log = RaftLog::new();
        log.append(entry(1));
        log.append(entry(1));
        log.append(entry(1));
        log.append(entry(2));
        // Follower is missing an entry the leader thinks exists at term 4, index 5.
        let x = log.locate_conflict(4, 5);
        // First index of the highest term (2) below 4 present in the log.
        assert_eq!(x, 4);
    }

    #[test]
    fn from_snapshot_rebuilds_sentinel() {
        let log = RaftLog::from_snapshot(10, 3);
        assert_eq!(log.first_index(), 10);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);
    }
}
