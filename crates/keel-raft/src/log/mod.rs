//! Replicated log abstraction.
//!
//! The consensus engine never touches storage directly: it speaks to a [`Log`]
//! implementation that keeps an ordered, contiguous range of entries and a
//! metadata slot for the durable projection of the node's term and vote.
//!
//! # Log invariants
//!
//! 1. Entry indices are strictly increasing and contiguous within
//!    `[first_index, last_index]`
//! 2. The range can shift: prefix truncation (compaction) raises
//!    `first_index`, suffix truncation (conflict resolution) lowers
//!    `last_index`
//! 3. Metadata written through [`Log::set_metadata`] must be readable again
//!    before the next election timeout in the worst case

mod memory;

pub use memory::MemoryLog;

use std::ops::RangeInclusive;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::term::{Term, TermId};
use crate::{LogIndex, NodeId};

/// Errors from log lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    /// The requested index lies outside `[first_index, last_index]`.
    #[error("log index {0} is out of range")]
    OutOfRange(LogIndex),
}

/// Capability an application payload must provide to live in the log.
///
/// Implemented by the consumer for its own entry type; the consensus core
/// only needs to rebuild payloads from raw bytes and account for their size.
pub trait LogData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Decodes a payload from raw bytes, `None` when the bytes are not a
    /// valid encoding.
    fn from_bytes(data: &[u8]) -> Option<Self>;

    /// Payload size in bytes.
    fn size_bytes(&self) -> usize;
}

impl LogData for bytes::Bytes {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        Some(bytes::Bytes::copy_from_slice(data))
    }

    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl LogData for String {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        String::from_utf8(data.to_vec()).ok()
    }

    fn size_bytes(&self) -> usize {
        self.len()
    }
}

/// One element of the replicated log.
///
/// The log carries cluster configuration markers next to application data;
/// configuration entries have no payload and report a zero size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogElement<D> {
    /// Cluster configuration marker.
    Configuration {
        /// Term the entry was created in.
        term: TermId,
        /// Position in the log.
        index: LogIndex,
    },
    /// Application payload.
    Data {
        /// Term the entry was created in.
        term: TermId,
        /// Position in the log.
        index: LogIndex,
        /// The payload itself.
        content: D,
    },
}

impl<D> LogElement<D> {
    /// Term the entry was created in.
    pub fn term(&self) -> TermId {
        match self {
            LogElement::Configuration { term, .. } => *term,
            LogElement::Data { term, .. } => *term,
        }
    }

    /// Position of the entry in the log.
    pub fn index(&self) -> LogIndex {
        match self {
            LogElement::Configuration { index, .. } => *index,
            LogElement::Data { index, .. } => *index,
        }
    }

    /// Payload of a data entry, `None` for configuration markers.
    pub fn content(&self) -> Option<&D> {
        match self {
            LogElement::Configuration { .. } => None,
            LogElement::Data { content, .. } => Some(content),
        }
    }
}

impl<D: LogData> LogElement<D> {
    /// Payload size in bytes; configuration markers are zero-sized.
    pub fn size_bytes(&self) -> usize {
        match self {
            LogElement::Configuration { .. } => 0,
            LogElement::Data { content, .. } => content.size_bytes(),
        }
    }
}

/// Durable projection of a node's [`Term`], round-tripped through the log's
/// storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Persisted term id, `None` before the first save.
    pub term: Option<TermId>,
    /// Persisted vote, `None` when the node has not voted in the term.
    pub voted_for: Option<NodeId>,
}

impl LogMetadata {
    /// Builds the durable projection of the given term state.
    pub fn from_term(term: &Term) -> Self {
        Self {
            term: Some(term.id()),
            voted_for: term.voted_for(),
        }
    }
}

/// Contract a replicated log must satisfy for the consensus engine.
///
/// Concrete implementations decide where entries and metadata live; the
/// engine only requires the contiguous-range semantics described in the
/// module docs.
pub trait Log: Send + 'static {
    /// Application payload type stored in data entries.
    type Data: LogData;

    /// Index of the first entry still present (after any compaction).
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or `first_index - 1` when the log is empty.
    fn last_index(&self) -> LogIndex;

    /// Looks up the entry at `index`.
    fn entry(&self, index: LogIndex) -> std::result::Result<LogElement<Self::Data>, LogError>;

    /// Appends entries at the tail, returning the index range they occupy.
    fn append(&mut self, entries: Vec<LogElement<Self::Data>>) -> RangeInclusive<LogIndex>;

    /// Drops all entries below `first_index` (compaction).
    fn truncate_prefix(&mut self, first_index: LogIndex);

    /// Drops all entries above `last_index` (conflict resolution).
    fn truncate_suffix(&mut self, last_index: LogIndex);

    /// Reads the metadata slot.
    fn metadata(&self) -> LogMetadata;

    /// Writes the metadata slot.
    fn set_metadata(&mut self, metadata: LogMetadata);

    /// Term of the last entry, 0 for an empty log.
    fn last_term(&self) -> TermId {
        self.entry(self.last_index()).map(|e| e.term()).unwrap_or(0)
    }
}
