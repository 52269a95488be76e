//! # HTTP cache transaction coordination
//!
//! The [`HttpCache`] makes sure that all transactions for the same [`CacheKey`] share a single
//! disk cache entry, and that at most one of them writes to it at any time.
//!
//! ## Active entries
//!
//! A key becomes *active* as soon as a transaction wants it. The [`ActiveEntry`] owns the disk
//! entry handle and tracks the participants: one optional writer, any number of readers, and a
//! FIFO queue of transactions waiting for their turn. Active entries live in an arena keyed by
//! [`EntryId`], and a map from key to id makes sure every key has at most one of them.
//!
//! Once the last participant is gone and nobody is waiting, the entry is *deactivated*: it is
//! removed from both the map and the arena, and the disk entry is closed, which commits what was
//! written to it.
//!
//! ## Dooming
//!
//! [`HttpCache::doom_entry`] removes an active entry from the key map, so later transactions get
//! a fresh entry, and moves it to the doomed set. Transactions already attached to a doomed entry
//! finish their work undisturbed, and the entry is *finalized* once they are done. Its contents
//! are thrown away. Transactions still waiting on a doomed entry start over against a new one.
//!
//! When a writer fails (or detaches without finishing) the entry is doomed as well, as a partially
//! written response can not be trusted. Everybody who was waiting for that writer is restarted and
//! never sees the partial data.
//!
//! ## Deferred processing
//!
//! Admitting queued transactions never happens inline while another transaction is being
//! released. Instead, [`process_pending_queue`](HttpCache::process_pending_queue) schedules a
//! [`Task`](tasks::Task) which is run by [`run_pending_tasks`](HttpCache::run_pending_tasks).
//! Transactions admitted or restarted by a task are reported through
//! [`take_notifications`](HttpCache::take_notifications).
//!
//! ## Promotion
//!
//! Queued transactions are admitted strictly in the order they arrived. A task admits at most one
//! transaction. A transaction that wants to write waits at the head of the queue until all readers
//! are gone, and becomes the next writer. A read-only transaction joins the readers, after which
//! another task is scheduled to look at the next one in line.
//!
//! ### Metrics
//!
//! - `http_cache.open`: Entries opened from the backend, tagged with `hit`.
//! - `http_cache.create`: Entries created on the backend.
//! - `http_cache.doom`: Keys doomed, tagged with whether the key was `active`.
//! - `http_cache.pending`: Transactions that had to be queued.
//! - `http_cache.restart`: Transactions that were restarted against a fresh entry.
//! - `http_cache.active_entries`: The number of active entries.
//! - `http_cache.tasks.duration`: Time spent running deferred tasks.
//! - `http_cache.tasks.count`: A histogram of the number of deferred tasks run at once.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::caching::{Backend, CacheContents, CacheError, CacheKey, Entry};
use crate::config::{CacheMode, Config};
use crate::transaction::{Admission, Role, TransactionId, TransactionState};

mod active_entry;
mod tasks;
#[cfg(test)]
mod tests;

pub(crate) use active_entry::ActiveEntry;
pub use active_entry::{EntryId, EntryInfo};

/// The outcome of [`HttpCache::add_transaction_to_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    /// The transaction is attached to the entry and may use it right away.
    Ready(Role),
    /// The transaction was queued, and will be notified once it is admitted.
    Pending,
}

/// A transaction was admitted, restarted or failed outside of a direct call.
///
/// This is how queued transactions learn that they can proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub transaction: TransactionId,
    /// What the transaction has to do now. This is never [`Admission::Pending`].
    pub outcome: CacheContents<Admission>,
}

/// Coordinates transactions on top of a disk cache [`Backend`].
///
/// All state is owned by a single `HttpCache` and modified through `&mut self`. Transactions are
/// identified by [`TransactionId`] and entries by [`EntryId`]; neither holds a reference into the
/// cache.
pub struct HttpCache<B: Backend> {
    pub(crate) backend: B,
    pub(crate) mode: CacheMode,
    pub(crate) key_headers: Vec<String>,

    pub(crate) active_entries: HashMap<CacheKey, EntryId>,
    pub(crate) entries: HashMap<EntryId, ActiveEntry<B::Entry>>,
    pub(crate) doomed_entries: HashSet<EntryId>,
    next_entry_id: u64,

    pub(crate) transactions: HashMap<TransactionId, TransactionState>,
    pub(crate) next_transaction_id: u64,

    pub(crate) tasks: VecDeque<tasks::Task>,
    notifications: Vec<Notification>,
}

impl<B: Backend> HttpCache<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            mode: CacheMode::default(),
            key_headers: Vec::new(),
            active_entries: HashMap::new(),
            entries: HashMap::new(),
            doomed_entries: HashSet::new(),
            next_entry_id: 0,
            transactions: HashMap::new(),
            next_transaction_id: 0,
            tasks: VecDeque::new(),
            notifications: Vec::new(),
        }
    }

    /// Creates a cache using the `mode` and `key_headers` of the given [`Config`].
    pub fn from_config(backend: B, config: &Config) -> Self {
        Self::new(backend)
            .with_mode(config.mode)
            .with_key_headers(config.key_headers.clone())
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the request headers that become part of every [`CacheKey`].
    pub fn with_key_headers(mut self, key_headers: Vec<String>) -> Self {
        self.key_headers = key_headers;
        self
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Opens the entry for `key`.
    ///
    /// This returns the active entry if there is one, and otherwise asks the backend and activates
    /// what it finds. Backend failures are logged and treated like a missing entry.
    pub fn open_entry(&mut self, key: &CacheKey) -> Option<EntryId> {
        if let Some(entry) = self.find_active_entry(key) {
            return Some(entry);
        }

        let disk_entry = match self.backend.open_entry(key) {
            Ok(disk_entry) => disk_entry,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(%key, error = dynerr, "Failed to open cache entry");
                None
            }
        };
        metric!(counter("http_cache.open") += 1, "hit" => if disk_entry.is_some() { "true" } else { "false" });

        self.activate_entry(key.clone(), disk_entry?).ok()
    }

    /// Creates a new entry for `key` on the backend and activates it.
    ///
    /// Returns `None` when the backend fails to create the entry.
    pub fn create_entry(&mut self, key: &CacheKey) -> Option<EntryId> {
        debug_assert!(self.find_active_entry(key).is_none());

        let disk_entry = match self.backend.create_entry(key) {
            Ok(disk_entry) => disk_entry,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(%key, error = dynerr, "Failed to create cache entry");
                return None;
            }
        };
        metric!(counter("http_cache.create") += 1);

        self.activate_entry(key.clone(), disk_entry).ok()
    }

    /// Makes `disk_entry` the active entry for `key`.
    ///
    /// There must not be an active entry for `key` yet. Otherwise `disk_entry` is closed and
    /// [`CacheError::EntryAlreadyActive`] is returned.
    pub fn activate_entry(&mut self, key: CacheKey, disk_entry: B::Entry) -> CacheContents<EntryId> {
        debug_assert!(
            !self.active_entries.contains_key(&key),
            "entry for `{key}` is already active"
        );
        if self.active_entries.contains_key(&key) {
            tracing::error!(%key, "Entry is already active");
            if let Err(err) = disk_entry.close() {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::error!(%key, error = dynerr, "Failed to close cache entry");
            }
            return Err(CacheError::EntryAlreadyActive(key.to_string()));
        }

        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;

        tracing::debug!(entry = %id, %key, "Activating cache entry");
        self.active_entries.insert(key.clone(), id);
        self.entries.insert(id, ActiveEntry::new(key, disk_entry));
        metric!(gauge("http_cache.active_entries") = self.active_entries.len() as u64);

        Ok(id)
    }

    /// Looks up the active entry for `key`.
    ///
    /// Doomed entries are not active.
    pub fn find_active_entry(&self, key: &CacheKey) -> Option<EntryId> {
        self.active_entries.get(key).copied()
    }

    /// Attaches `transaction` to `entry`, or queues it if that is not possible right now.
    ///
    /// A transaction has to queue if the entry has a writer, or if other transactions are already
    /// waiting or about to be admitted. Otherwise, a transaction that wants to write becomes the
    /// writer unless there are readers, and any other transaction becomes a reader.
    ///
    /// The transaction must not be attached to or waiting for any entry, and a doomed entry
    /// does not take new transactions.
    pub fn add_transaction_to_entry(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
    ) -> CacheContents<AddStatus> {
        let state = self
            .transactions
            .get(&transaction)
            .ok_or(CacheError::UnknownTransaction)?;
        if state.entry.is_some() {
            return Err(CacheError::AlreadyAttached);
        }
        let active = self.entries.get_mut(&entry).ok_or(CacheError::NotAttached)?;
        if active.doomed {
            return Err(CacheError::EntryDoomed);
        }

        if active.writer.is_some()
            || active.will_process_pending_queue
            || !active.pending_queue.is_empty()
        {
            Ok(self.enqueue(entry, transaction))
        } else {
            Ok(self.attach(entry, transaction))
        }
    }

    /// Attaches `transaction` as writer or reader, depending on its mode.
    ///
    /// Only a writer waiting for readers to leave ends up in the queue.
    fn attach(&mut self, entry: EntryId, transaction: TransactionId) -> AddStatus {
        let Some(state) = self.transactions.get_mut(&transaction) else {
            return AddStatus::Pending;
        };
        let Some(active) = self.entries.get_mut(&entry) else {
            return AddStatus::Pending;
        };

        let role = if state.wants_write() {
            if !active.readers.is_empty() {
                return self.enqueue(entry, transaction);
            }
            active.writer = Some(transaction);
            Role::Writer
        } else {
            active.readers.push(transaction);
            Role::Reader
        };

        state.entry = Some(entry);
        state.role = Some(role);
        AddStatus::Ready(role)
    }

    fn enqueue(&mut self, entry: EntryId, transaction: TransactionId) -> AddStatus {
        if let Some(active) = self.entries.get_mut(&entry) {
            active.pending_queue.push_back(transaction);
        }
        if let Some(state) = self.transactions.get_mut(&transaction) {
            state.entry = Some(entry);
            state.role = None;
        }
        tracing::debug!(%entry, %transaction, "Transaction is pending");
        metric!(counter("http_cache.pending") += 1);
        AddStatus::Pending
    }

    /// Marks `transaction` as no longer attached to any entry.
    fn release(&mut self, transaction: TransactionId) {
        if let Some(state) = self.transactions.get_mut(&transaction) {
            state.entry = None;
            state.role = None;
        }
    }

    /// The writer of `entry` is done.
    ///
    /// On success, the pending queue gets processed. Otherwise the entry is doomed and destroyed
    /// right away, and every queued transaction is restarted against a fresh entry.
    pub fn done_writing_to_entry(&mut self, entry: EntryId, success: bool) {
        let Some(active) = self.entries.get_mut(&entry) else {
            return;
        };
        debug_assert!(active.readers.is_empty());

        let writer = active.writer.take();
        tracing::debug!(%entry, key = %active.key, success, "Done writing to entry");

        if success {
            if let Some(writer) = writer {
                self.release(writer);
            }
            self.process_pending_queue(entry);
            return;
        }

        let pending: Vec<_> = active.pending_queue.drain(..).collect();
        active.disk_entry.doom();
        if let Some(writer) = writer {
            self.release(writer);
        }
        self.destroy_entry(entry);

        for transaction in pending {
            self.restart_transaction(transaction);
        }
    }

    /// `transaction` stops reading from `entry`.
    pub fn done_reading_from_entry(&mut self, entry: EntryId, transaction: TransactionId) {
        let Some(active) = self.entries.get_mut(&entry) else {
            return;
        };
        debug_assert!(active.writer.is_none());
        if !active.remove_reader(transaction) {
            tracing::warn!(%entry, %transaction, "Transaction is not a reader of entry");
            return;
        }
        let drained = active.readers.is_empty();
        let nobody_waiting = active.pending_queue.is_empty();
        self.release(transaction);

        if drained {
            if nobody_waiting {
                self.destroy_entry(entry);
            } else {
                self.process_pending_queue(entry);
            }
        }
    }

    /// Turns the writer of `entry` into a reader.
    ///
    /// This is what a read-write transaction does once it finds the stored response usable.
    pub fn convert_writer_to_reader(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(&entry) else {
            return;
        };
        debug_assert!(active.readers.is_empty());
        let Some(writer) = active.writer.take() else {
            return;
        };
        active.readers.push(writer);
        if let Some(state) = self.transactions.get_mut(&writer) {
            state.role = Some(Role::Reader);
        }

        self.process_pending_queue(entry);
    }

    /// `transaction` is done with `entry`, either as its writer or as one of its readers.
    ///
    /// A writer that is `cancel`ed leaves an incomplete response behind, which dooms the entry.
    pub fn done_with_entry(&mut self, entry: EntryId, transaction: TransactionId, cancel: bool) {
        let is_writer = self
            .entries
            .get(&entry)
            .is_some_and(|active| active.writer == Some(transaction));

        if is_writer {
            self.done_writing_to_entry(entry, !cancel);
        } else {
            self.done_reading_from_entry(entry, transaction);
        }
    }

    /// Removes `transaction` from the queue of the active or doomed entry it is waiting on.
    ///
    /// Returns `false` if the transaction was not waiting on any entry.
    pub fn remove_pending_transaction(&mut self, transaction: TransactionId) -> bool {
        let Some(entry) = self
            .transactions
            .get(&transaction)
            .and_then(|state| state.entry)
        else {
            return false;
        };
        let removed = self
            .entries
            .get_mut(&entry)
            .is_some_and(|active| active.remove_pending(transaction));
        if removed {
            self.release(transaction);
        }
        removed
    }

    /// Dooms the entry for `key`.
    ///
    /// An active entry is removed from the key map, so no new transaction can attach to it. Its
    /// participants continue undisturbed and the entry is finalized once they are done. Queued
    /// transactions are restarted against a fresh entry.
    ///
    /// Without an active entry, the key is doomed on the backend directly. Returns whether the key
    /// was active.
    pub fn doom_entry(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.active_entries.remove(key) else {
            metric!(counter("http_cache.doom") += 1, "active" => "false");
            if let Err(err) = self.backend.doom_entry(key) {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(%key, error = dynerr, "Failed to doom cache entry");
            }
            return false;
        };
        metric!(counter("http_cache.doom") += 1, "active" => "true");
        metric!(gauge("http_cache.active_entries") = self.active_entries.len() as u64);

        let Some(active) = self.entries.get_mut(&entry) else {
            return true;
        };
        tracing::debug!(%entry, %key, "Dooming active entry");
        active.doomed = true;
        active.disk_entry.doom();
        self.doomed_entries.insert(entry);

        if !active.pending_queue.is_empty() {
            self.process_pending_queue(entry);
        } else if active.is_idle() {
            self.destroy_entry(entry);
        }
        true
    }

    /// Deactivates `entry`, closing its disk entry.
    ///
    /// The entry must not have a writer or readers anymore.
    pub fn deactivate_entry(&mut self, entry: EntryId) {
        let Some(active) = self.entries.remove(&entry) else {
            return;
        };
        debug_assert!(active.is_idle());

        if self.active_entries.get(&active.key) == Some(&entry) {
            self.active_entries.remove(&active.key);
            metric!(gauge("http_cache.active_entries") = self.active_entries.len() as u64);
        }
        self.doomed_entries.remove(&entry);
        tracing::debug!(%entry, key = %active.key, doomed = active.doomed, "Deactivating cache entry");

        let ActiveEntry {
            key,
            disk_entry,
            pending_queue,
            ..
        } = active;
        if let Err(err) = disk_entry.close() {
            let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
            tracing::error!(%key, error = dynerr, "Failed to close cache entry");
        }

        // nobody is left behind on an entry that is gone
        for transaction in pending_queue {
            self.restart_transaction(transaction);
        }
    }

    /// Destroys an entry once it is no longer needed.
    ///
    /// A doomed entry is finalized and its contents are discarded, any other entry is deactivated.
    pub(crate) fn destroy_entry(&mut self, entry: EntryId) {
        let doomed = self.entries.get(&entry).is_some_and(|active| active.doomed);
        if doomed {
            self.finalize_doomed_entry(entry);
        } else {
            self.deactivate_entry(entry);
        }
    }

    fn finalize_doomed_entry(&mut self, entry: EntryId) {
        debug_assert!(self.doomed_entries.contains(&entry));
        self.deactivate_entry(entry);
    }

    /// Restarts a transaction that was waiting on an entry which is going away.
    ///
    /// The transaction goes through [`add_to_entry`](Self::add_to_entry) again, and is notified
    /// unless it ends up queued once more.
    pub(crate) fn restart_transaction(&mut self, transaction: TransactionId) {
        if !self.transactions.contains_key(&transaction) {
            return;
        }
        self.release(transaction);
        tracing::debug!(%transaction, "Restarting transaction");
        metric!(counter("http_cache.restart") += 1);

        let outcome = self.add_to_entry(transaction);
        if outcome != Ok(Admission::Pending) {
            self.notify(transaction, outcome);
        }
    }

    pub(crate) fn notify(&mut self, transaction: TransactionId, outcome: CacheContents<Admission>) {
        self.notifications.push(Notification {
            transaction,
            outcome,
        });
    }

    /// Returns the notifications that accumulated since the last call.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// The number of active entries.
    pub fn active_entry_count(&self) -> usize {
        self.active_entries.len()
    }

    /// The number of doomed entries that still have participants.
    pub fn doomed_entry_count(&self) -> usize {
        self.doomed_entries.len()
    }

    /// Returns a snapshot of the participants of an active or doomed entry.
    pub fn entry_info(&self, entry: EntryId) -> Option<EntryInfo> {
        self.entries.get(&entry).map(ActiveEntry::info)
    }
}
