//! In-memory view of the replicated log.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use constellation_common::{ConstellationError, Result};

use super::{LogIndex, Term, Voters};

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms
    Blank,
    /// Opaque state machine command
    Command(Vec<u8>),
    /// New voter set, effective as soon as it is appended
    Membership(Voters),
}

/// A single entry in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self { term, index, payload }
    }
}

/// Log entries after the latest snapshot
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    /// Rebuild from a snapshot point and the entries persisted after it
    pub fn restore(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Result<Self> {
        let mut log = Self {
            entries: VecDeque::new(),
            first_index: snapshot_index + 1,
            snapshot_term,
        };
        for entry in entries.into_iter().filter(|e| e.index > snapshot_index) {
            log.append(entry)?;
        }
        Ok(log)
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index covered by the latest snapshot (0 when none)
    pub fn snapshot_index(&self) -> LogIndex {
        self.first_index - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(ConstellationError::Internal(format!(
                "log append out of order: expected index {expected}, got {}",
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start > self.last_index() {
            return Vec::new();
        }
        let start = start.max(self.first_index);
        self.entries
            .iter()
            .skip((start - self.first_index) as usize)
            .take(max)
            .cloned()
            .collect()
    }

    /// Drop `index` and everything after it
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Does our log contain an entry at `index` with `term`?
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Drop entries up to and including `up_to`, now covered by a snapshot
    pub fn compact(&mut self, up_to: LogIndex, term: Term) {
        if up_to < self.first_index {
            return;
        }
        let remove = (up_to - self.first_index + 1) as usize;
        self.entries.drain(..remove.min(self.entries.len()));
        self.first_index = up_to + 1;
        self.snapshot_term = term;
    }

    /// Discard everything and restart after a snapshot point
    pub fn reset(&mut self, snapshot_index: LogIndex, snapshot_term: Term) {
        self.entries.clear();
        self.first_index = snapshot_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Is a candidate's log at least as up-to-date as ours?
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        if last_log_term != our_term {
            last_log_term > our_term
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// Latest voter set recorded in the retained entries, at or before `index`
    pub fn membership_at(&self, index: LogIndex) -> Option<(LogIndex, Voters)> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.payload {
                EntryPayload::Membership(voters) => Some((e.index, voters.clone())),
                _ => None,
            })
    }

    /// Latest voter set recorded in the retained entries
    pub fn latest_membership(&self) -> Option<(LogIndex, Voters)> {
        self.membership_at(self.last_index())
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
