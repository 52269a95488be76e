use std::collections::VecDeque;
use std::fmt;

use crate::caching::{CacheKey, Entry};
use crate::transaction::TransactionId;

/// Identifies an [`ActiveEntry`] within its [`HttpCache`](super::HttpCache).
///
/// Ids are never reused, so a stale id simply no longer resolves once its entry is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// The bookkeeping for one cache key with in-flight transactions.
///
/// Owns the disk entry handle for as long as the entry is active or doomed.
pub(crate) struct ActiveEntry<E> {
    pub key: CacheKey,
    pub disk_entry: E,
    pub writer: Option<TransactionId>,
    pub readers: Vec<TransactionId>,
    pub pending_queue: VecDeque<TransactionId>,
    /// Set while a run of the pending queue is scheduled.
    pub will_process_pending_queue: bool,
    pub doomed: bool,
}

impl<E: Entry> ActiveEntry<E> {
    pub fn new(key: CacheKey, disk_entry: E) -> Self {
        Self {
            key,
            disk_entry,
            writer: None,
            readers: Vec::new(),
            pending_queue: VecDeque::new(),
            will_process_pending_queue: false,
            doomed: false,
        }
    }

    /// Whether no transaction is currently attached as writer or reader.
    pub fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    pub fn remove_reader(&mut self, transaction: TransactionId) -> bool {
        match self.readers.iter().position(|t| *t == transaction) {
            Some(idx) => {
                self.readers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn remove_pending(&mut self, transaction: TransactionId) -> bool {
        match self.pending_queue.iter().position(|t| *t == transaction) {
            Some(idx) => {
                self.pending_queue.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            writer: self.writer,
            readers: self.readers.clone(),
            pending: self.pending_queue.iter().copied().collect(),
            doomed: self.doomed,
        }
    }
}

/// A snapshot of the participants of an active or doomed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub writer: Option<TransactionId>,
    pub readers: Vec<TransactionId>,
    /// The queued transactions, in admission order.
    pub pending: Vec<TransactionId>,
    pub doomed: bool,
}
