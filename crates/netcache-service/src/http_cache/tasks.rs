use std::time::Instant;

use crate::caching::Backend;
use crate::metric;
use crate::transaction::{Admission, TransactionMode};

use super::{AddStatus, EntryId, HttpCache};

/// Work deferred to a later turn of the cache's task loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Task {
    ProcessPendingQueue(EntryId),
}

impl<B: Backend> HttpCache<B> {
    /// Schedules a run of the pending queue of `entry`.
    ///
    /// This never admits anything inline. Callers are usually in the middle of releasing a
    /// transaction, and admission happens once [`run_pending_tasks`](Self::run_pending_tasks)
    /// gets to it. Scheduling an already scheduled entry is a noop.
    pub fn process_pending_queue(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(&entry) else {
            return;
        };
        if active.will_process_pending_queue {
            return;
        }
        active.will_process_pending_queue = true;
        self.tasks.push_back(Task::ProcessPendingQueue(entry));
    }

    /// Runs deferred tasks until there are none left, including tasks scheduled while running.
    ///
    /// Returns the number of tasks that were run.
    pub fn run_pending_tasks(&mut self) -> usize {
        if self.tasks.is_empty() {
            return 0;
        }
        let start = Instant::now();
        let mut ran = 0;
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::ProcessPendingQueue(entry) => self.on_process_pending_queue(entry),
            }
            ran += 1;
        }
        metric!(timer("http_cache.tasks.duration") = start.elapsed());
        metric!(time_raw("http_cache.tasks.count") = ran as u64);
        ran
    }

    /// Whether deferred tasks are waiting to be run.
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    fn on_process_pending_queue(&mut self, entry: EntryId) {
        // the entry may have been destroyed since this was scheduled
        let Some(active) = self.entries.get_mut(&entry) else {
            return;
        };
        active.will_process_pending_queue = false;

        if active.doomed && !active.pending_queue.is_empty() {
            // nobody may attach to a doomed entry, so everybody waiting starts over
            let pending: Vec<_> = active.pending_queue.drain(..).collect();
            if active.is_idle() {
                self.destroy_entry(entry);
            }
            for transaction in pending {
                self.restart_transaction(transaction);
            }
            return;
        }

        if active.writer.is_some() {
            return;
        }

        let Some(&next) = active.pending_queue.front() else {
            if active.readers.is_empty() {
                self.destroy_entry(entry);
            }
            return;
        };

        let wants_write = self
            .transactions
            .get(&next)
            .is_some_and(|state| state.mode.contains(TransactionMode::WRITE));
        // a writer has to wait for the current readers to leave
        if wants_write && !active.readers.is_empty() {
            return;
        }

        active.pending_queue.pop_front();
        match self.attach(entry, next) {
            AddStatus::Ready(role) => {
                tracing::debug!(%entry, transaction = %next, ?role, "Admitted pending transaction");
                self.notify(next, Ok(Admission::from(role)));
                let more_pending = self
                    .entries
                    .get(&entry)
                    .is_some_and(|active| !active.pending_queue.is_empty());
                if more_pending {
                    self.process_pending_queue(entry);
                }
            }
            AddStatus::Pending => {}
        }
    }
}
