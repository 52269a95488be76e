//! Transactions: how individual requests use the [`HttpCache`].
//!
//! A transaction is started for a [`RequestInfo`]. Depending on the cache mode, the request's
//! load flags and headers, it gets a [`TransactionMode`] and is then attached to the entry for its
//! [`CacheKey`]. The resulting [`Admission`] tells the caller what to do:
//!
//! - [`Admission::Reader`]: serve the stored response via
//!   [`read_response_info`](HttpCache::read_response_info) and
//!   [`read_data`](HttpCache::read_data).
//! - [`Admission::Writer`]: the transaction owns the entry. It can look at a stored response (if
//!   any) and either [convert to a reader](HttpCache::convert_to_reader) when that is usable, or
//!   fetch from the network and store the result, followed by
//!   [`finish_writing`](HttpCache::finish_writing).
//! - [`Admission::Bypass`]: the cache is not used, the request goes to the network.
//! - [`Admission::Pending`]: the transaction waits for its turn, and is notified through
//!   [`take_notifications`](HttpCache::take_notifications).

use std::fmt;

use bitflags::bitflags;

use crate::caching::{Backend, CacheContents, CacheError, CacheKey, DataStream, Entry};
use crate::config::CacheMode;
use crate::http_cache::{AddStatus, EntryId, HttpCache};

mod request;
mod response;

pub use request::{EffectiveLoad, LoadFlags, RequestInfo};
pub use response::ResponseInfo;

/// Identifies a transaction within its [`HttpCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub(crate) u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

bitflags! {
    /// How a transaction uses the cache.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TransactionMode: u8 {
        const READ_META = 1 << 0;
        const READ_DATA = 1 << 1;
        /// Read a stored response.
        const READ = Self::READ_META.bits() | Self::READ_DATA.bits();
        /// Store a response.
        const WRITE = 1 << 2;
        /// Use a stored response if it is usable, and store a new one otherwise.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Update the metadata of a stored response, without reading its data.
        const UPDATE = Self::READ_META.bits() | Self::WRITE.bits();
    }
}

impl TransactionMode {
    /// The cache is not used at all.
    pub const NONE: Self = Self::empty();
}

/// The way a transaction is attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Writer,
    Reader,
}

/// What a started (or restarted) transaction has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Admission {
    /// Attached as the only writer of the entry.
    Writer,
    /// Attached as one of the readers of the entry.
    Reader,
    /// Queued behind other transactions.
    Pending,
    /// Not using the cache.
    Bypass,
}

impl From<Role> for Admission {
    fn from(role: Role) -> Self {
        match role {
            Role::Writer => Self::Writer,
            Role::Reader => Self::Reader,
        }
    }
}

/// What the cache knows about a transaction.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransactionState {
    pub mode: TransactionMode,
    pub load_flags: LoadFlags,
    pub key: Option<CacheKey>,
    /// The entry the transaction is attached to, or queued on when there is no `role`.
    pub entry: Option<EntryId>,
    pub role: Option<Role>,
}

impl TransactionState {
    pub fn wants_write(&self) -> bool {
        self.mode.contains(TransactionMode::WRITE)
    }
}

impl<B: Backend> HttpCache<B> {
    /// Registers a new transaction.
    pub fn new_transaction(&mut self) -> TransactionId {
        let id = TransactionId(self.next_transaction_id);
        self.next_transaction_id += 1;
        self.transactions.insert(id, TransactionState::default());
        id
    }

    pub fn transaction_mode(&self, transaction: TransactionId) -> Option<TransactionMode> {
        self.transactions.get(&transaction).map(|state| state.mode)
    }

    /// Returns the load flags in effect for `transaction`, as computed when it was started.
    pub fn transaction_load_flags(&self, transaction: TransactionId) -> Option<LoadFlags> {
        self.transactions
            .get(&transaction)
            .map(|state| state.load_flags)
    }

    /// Returns the entry `transaction` is attached to or waiting on.
    pub fn transaction_entry(&self, transaction: TransactionId) -> Option<EntryId> {
        self.transactions
            .get(&transaction)
            .and_then(|state| state.entry)
    }

    pub fn transaction_role(&self, transaction: TransactionId) -> Option<Role> {
        self.transactions
            .get(&transaction)
            .and_then(|state| state.role)
    }

    /// Creates the [`CacheKey`] for `request`.
    ///
    /// Besides method and URL, the key contains the upload identifier and the values of the
    /// configured key headers present on the request.
    pub fn generate_cache_key(&self, request: &RequestInfo) -> CacheKey {
        let mut builder = CacheKey::builder(&request.method, &request.url);
        if let Some(upload_id) = request.upload_id.filter(|id| *id != 0) {
            builder = builder.upload_id(upload_id);
        }
        for name in &self.key_headers {
            if let Some(value) = request.header(name) {
                builder = builder.header(name, value);
            }
        }
        builder.build()
    }

    /// Whether `request` bypasses the cache entirely.
    pub fn should_pass_through(&self, request: &RequestInfo, load: &EffectiveLoad) -> bool {
        // recording and playback always go through the cache
        if matches!(self.mode, CacheMode::Record | CacheMode::Playback) {
            return false;
        }
        if load.load_flags.contains(LoadFlags::DISABLE_CACHE) {
            return true;
        }
        if request.method.eq_ignore_ascii_case("GET") {
            return false;
        }
        if request.method.eq_ignore_ascii_case("POST") && request.upload_id.is_some_and(|id| id != 0)
        {
            return false;
        }
        true
    }

    /// Starts `transaction` for `request`, attaching it to the entry for the request's key.
    ///
    /// A transaction that was already attached somewhere is detached first, as if it was
    /// canceled.
    #[tracing::instrument(skip_all, fields(transaction = %transaction, method = %request.method, url = %request.url))]
    pub fn start_transaction(
        &mut self,
        transaction: TransactionId,
        request: &RequestInfo,
    ) -> CacheContents<Admission> {
        if !self.transactions.contains_key(&transaction) {
            return Err(CacheError::UnknownTransaction);
        }
        self.leave_entry(transaction);

        let load = request.effective_load(self.mode);
        let pass_through = self.should_pass_through(request, &load);
        let key = (!pass_through).then(|| self.generate_cache_key(request));

        let mut mode = if pass_through {
            TransactionMode::NONE
        } else if load.load_flags.contains(LoadFlags::ONLY_FROM_CACHE) {
            TransactionMode::READ
        } else if load.load_flags.contains(LoadFlags::BYPASS_CACHE) {
            TransactionMode::WRITE
        } else {
            TransactionMode::READ_WRITE
        };

        // the caller validates on its own, so we only get to update what we have
        if load.externally_conditionalized && mode != TransactionMode::NONE {
            mode = if mode.contains(TransactionMode::WRITE) {
                TransactionMode::UPDATE
            } else {
                TransactionMode::NONE
            };
        }

        tracing::trace!(?mode, key = key.as_ref().map(CacheKey::metadata), "Starting transaction");

        if let Some(state) = self.transactions.get_mut(&transaction) {
            state.mode = mode;
            state.load_flags = load.load_flags;
            state.key = key;
        }

        if mode == TransactionMode::NONE {
            if load.load_flags.contains(LoadFlags::ONLY_FROM_CACHE) {
                return Err(CacheError::CacheMiss);
            }
            return Ok(Admission::Bypass);
        }

        self.add_to_entry(transaction)
    }

    /// Attaches `transaction` to the entry for its key, opening or creating the entry as needed.
    ///
    /// A transaction that only writes dooms whatever is stored and creates a new entry. Any other
    /// transaction uses an existing entry, and the outcome of a missing one depends on the mode:
    /// read-write transactions go on to create it, updates bypass the cache and reads fail with a
    /// [`CacheError::CacheMiss`]. If the entry can not be created, the transaction bypasses the
    /// cache.
    pub fn add_to_entry(&mut self, transaction: TransactionId) -> CacheContents<Admission> {
        let state = self
            .transactions
            .get(&transaction)
            .ok_or(CacheError::UnknownTransaction)?;
        let Some(key) = state.key.clone() else {
            return Ok(Admission::Bypass);
        };
        let mut mode = state.mode;

        let entry = if mode == TransactionMode::WRITE {
            self.doom_entry(&key);
            None
        } else {
            self.open_entry(&key)
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                if mode == TransactionMode::UPDATE {
                    // there is nothing to update
                    self.set_mode(transaction, TransactionMode::NONE);
                    return Ok(Admission::Bypass);
                }
                if mode == TransactionMode::READ {
                    self.set_mode(transaction, TransactionMode::NONE);
                    return Err(CacheError::CacheMiss);
                }
                mode = TransactionMode::WRITE;
                match self.create_entry(&key) {
                    Some(entry) => entry,
                    None => {
                        self.set_mode(transaction, TransactionMode::NONE);
                        return Ok(Admission::Bypass);
                    }
                }
            }
        };

        self.set_mode(transaction, mode);
        match self.add_transaction_to_entry(entry, transaction)? {
            AddStatus::Ready(role) => Ok(role.into()),
            AddStatus::Pending => Ok(Admission::Pending),
        }
    }

    fn set_mode(&mut self, transaction: TransactionId, mode: TransactionMode) {
        if let Some(state) = self.transactions.get_mut(&transaction) {
            state.mode = mode;
        }
    }

    fn attachment(&self, transaction: TransactionId) -> CacheContents<(EntryId, Role)> {
        let state = self
            .transactions
            .get(&transaction)
            .ok_or(CacheError::UnknownTransaction)?;
        match (state.entry, state.role) {
            (Some(entry), Some(role)) => Ok((entry, role)),
            _ => Err(CacheError::NotAttached),
        }
    }

    fn writer_entry(&self, transaction: TransactionId) -> CacheContents<EntryId> {
        match self.attachment(transaction)? {
            (entry, Role::Writer) => Ok(entry),
            (_, Role::Reader) => Err(CacheError::NotWriter),
        }
    }

    fn disk_entry(&self, entry: EntryId) -> CacheContents<&B::Entry> {
        self.entries
            .get(&entry)
            .map(|active| &active.disk_entry)
            .ok_or(CacheError::NotAttached)
    }

    fn disk_entry_mut(&mut self, entry: EntryId) -> CacheContents<&mut B::Entry> {
        self.entries
            .get_mut(&entry)
            .map(|active| &mut active.disk_entry)
            .ok_or(CacheError::NotAttached)
    }

    /// Returns the size of `stream` of the entry `transaction` is attached to.
    pub fn data_size(&self, transaction: TransactionId, stream: DataStream) -> CacheContents<usize> {
        let (entry, _) = self.attachment(transaction)?;
        Ok(self.disk_entry(entry)?.data_size(stream))
    }

    /// Reads from `stream` of the entry `transaction` is attached to.
    pub fn read_data(
        &self,
        transaction: TransactionId,
        stream: DataStream,
        offset: usize,
        buf: &mut [u8],
    ) -> CacheContents<usize> {
        let (entry, _) = self.attachment(transaction)?;
        self.disk_entry(entry)?
            .read_data(stream, offset, buf)
            .map_err(|err| {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(%transaction, error = dynerr, "Failed to read cache entry");
                CacheError::ReadFailure
            })
    }

    /// Writes to `stream` of the entry `transaction` is the writer of.
    pub fn write_data(
        &mut self,
        transaction: TransactionId,
        stream: DataStream,
        offset: usize,
        data: &[u8],
        truncate: bool,
    ) -> CacheContents<usize> {
        let entry = self.writer_entry(transaction)?;
        let written = self
            .disk_entry_mut(entry)?
            .write_data(stream, offset, data, truncate)?;
        Ok(written)
    }

    /// Reads the stored [`ResponseInfo`].
    ///
    /// An entry without response info is a [`CacheError::CacheMiss`], and so is a truncated
    /// response for a transaction that can only read.
    pub fn read_response_info(&self, transaction: TransactionId) -> CacheContents<ResponseInfo> {
        let (entry, _) = self.attachment(transaction)?;
        let disk_entry = self.disk_entry(entry)?;

        let size = disk_entry.data_size(DataStream::ResponseInfo);
        if size == 0 {
            return Err(CacheError::CacheMiss);
        }
        let mut buf = vec![0; size];
        let len = self.read_data(transaction, DataStream::ResponseInfo, 0, &mut buf)?;

        let info: ResponseInfo = serde_json::from_slice(&buf[..len]).map_err(|err| {
            let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
            tracing::warn!(%transaction, error = dynerr, "Malformed response info");
            CacheError::ReadFailure
        })?;

        let mode = self.transaction_mode(transaction).unwrap_or_default();
        if info.truncated && mode == TransactionMode::READ {
            return Err(CacheError::CacheMiss);
        }
        Ok(info)
    }

    /// Stores `info` as the response info of the entry `transaction` is the writer of.
    pub fn write_response_info(
        &mut self,
        transaction: TransactionId,
        info: &ResponseInfo,
    ) -> CacheContents<()> {
        let data = serde_json::to_vec(info)?;
        self.write_data(transaction, DataStream::ResponseInfo, 0, &data, true)?;
        Ok(())
    }

    /// The writer `transaction` found the stored response usable, and continues as a reader.
    pub fn convert_to_reader(&mut self, transaction: TransactionId) -> CacheContents<()> {
        let entry = self.writer_entry(transaction)?;
        self.convert_writer_to_reader(entry);
        self.set_mode(transaction, TransactionMode::READ);
        Ok(())
    }

    /// The writer `transaction` is done writing.
    ///
    /// Without `success`, the entry is doomed and transactions waiting for it start over.
    pub fn finish_writing(&mut self, transaction: TransactionId, success: bool) -> CacheContents<()> {
        let entry = self.writer_entry(transaction)?;
        self.done_writing_to_entry(entry, success);
        self.set_mode(transaction, TransactionMode::NONE);
        Ok(())
    }

    /// The reader `transaction` is done reading.
    pub fn finish_reading(&mut self, transaction: TransactionId) -> CacheContents<()> {
        match self.attachment(transaction)? {
            (entry, Role::Reader) => {
                self.done_reading_from_entry(entry, transaction);
                self.set_mode(transaction, TransactionMode::NONE);
                Ok(())
            }
            (_, Role::Writer) => Err(CacheError::NotReader),
        }
    }

    /// Detaches `transaction` from its entry and forgets about it.
    ///
    /// A writer that did not finish leaves a partial response behind, and the entry is doomed.
    pub fn detach_transaction(&mut self, transaction: TransactionId) {
        self.leave_entry(transaction);
        self.transactions.remove(&transaction);
    }

    fn leave_entry(&mut self, transaction: TransactionId) {
        let Some(state) = self.transactions.get(&transaction) else {
            return;
        };
        match (state.entry, state.role) {
            (Some(entry), Some(_)) => self.done_with_entry(entry, transaction, true),
            (Some(_), None) => {
                self.remove_pending_transaction(transaction);
            }
            (None, _) => {}
        }
    }
}
