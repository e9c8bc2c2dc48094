//! In-memory log.
//!
//! Keeps the whole entry range in a `VecDeque` and the metadata slot in a
//! plain field. Nothing survives a restart, which makes this the log of
//! choice for tests and in-process simulations.

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use crate::LogIndex;

use super::{Log, LogData, LogElement, LogError, LogMetadata};

/// A [`Log`] holding all entries in memory.
///
/// The logical index of an entry differs from its physical position once the
/// prefix has been truncated:
///
/// ```text
/// logical_index = physical_position + start_index
/// ```
#[derive(Debug, Clone)]
pub struct MemoryLog<D> {
    /// Logical index of the first stored entry.
    start_index: LogIndex,
    /// The stored entries, front = oldest.
    storage: VecDeque<LogElement<D>>,
    /// In-memory metadata slot.
    metadata: LogMetadata,
}

impl<D> MemoryLog<D> {
    /// Creates an empty log whose first entry will live at index 1.
    pub fn new() -> Self {
        Self {
            start_index: 1,
            storage: VecDeque::new(),
            metadata: LogMetadata::default(),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<D> Default for MemoryLog<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: LogData> Log for MemoryLog<D> {
    type Data = D;

    fn first_index(&self) -> LogIndex {
        self.start_index
    }

    fn last_index(&self) -> LogIndex {
        self.start_index + self.storage.len() as u64 - 1
    }

    fn entry(&self, index: LogIndex) -> Result<LogElement<D>, LogError> {
        if index < self.start_index {
            return Err(LogError::OutOfRange(index));
        }
        self.storage
            .get((index - self.start_index) as usize)
            .cloned()
            .ok_or(LogError::OutOfRange(index))
    }

    fn append(&mut self, entries: Vec<LogElement<D>>) -> RangeInclusive<LogIndex> {
        let first = self.start_index + self.storage.len() as u64;
        let last = first + entries.len() as u64 - 1;
        self.storage.extend(entries);
        first..=last
    }

    fn truncate_prefix(&mut self, first_index: LogIndex) {
        if first_index > self.start_index {
            let drop = (first_index - self.start_index).min(self.storage.len() as u64);
            self.storage.drain(..drop as usize);
            self.start_index = first_index;
        }
    }

    fn truncate_suffix(&mut self, last_index: LogIndex) {
        if last_index < self.start_index {
            self.storage.clear();
        } else {
            let keep = (last_index - self.start_index + 1) as usize;
            self.storage.truncate(keep);
        }
    }

    fn metadata(&self) -> LogMetadata {
        self.metadata
    }

    fn set_metadata(&mut self, metadata: LogMetadata) {
        self.metadata = metadata;
    }
}
