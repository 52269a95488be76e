use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::EntryData;
use super::{Backend, CacheKey, DataStream, Entry};

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<CacheKey, EntryData>>,
    fail_opens: AtomicBool,
    fail_creates: AtomicBool,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, EntryData>> {
        // the map is never left in an inconsistent state, so recovering from poisoning is fine
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A [`Backend`] keeping entries in memory.
///
/// Clones share the same storage, which makes it possible to keep a handle for inspection while
/// the [`HttpCache`](crate::http_cache::HttpCache) owns another one. Written data is committed
/// into the storage when an entry is closed without having been doomed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of committed entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a committed entry exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Returns the committed contents of `stream` for `key`.
    pub fn stream(&self, key: &CacheKey, stream: DataStream) -> Option<Vec<u8>> {
        self.entries()
            .get(key)
            .map(|data| data.stream(stream).to_vec())
    }

    /// Makes all following [`Backend::open_entry`] calls fail with an I/O error.
    pub fn set_fail_opens(&self, fail: bool) {
        self.shared.fail_opens.store(fail, Ordering::Relaxed);
    }

    /// Makes all following [`Backend::create_entry`] calls fail with an I/O error.
    pub fn set_fail_creates(&self, fail: bool) {
        self.shared.fail_creates.store(fail, Ordering::Relaxed);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, EntryData>> {
        self.shared.entries()
    }
}

impl Backend for MemoryBackend {
    type Entry = MemoryEntry;

    fn open_entry(&mut self, key: &CacheKey) -> io::Result<Option<MemoryEntry>> {
        if self.shared.fail_opens.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected open failure"));
        }
        let entry = self.entries().get(key).cloned().map(|data| MemoryEntry {
            key: key.clone(),
            data,
            shared: self.shared.clone(),
            dirty: false,
            doomed: false,
        });
        Ok(entry)
    }

    fn create_entry(&mut self, key: &CacheKey) -> io::Result<MemoryEntry> {
        if self.shared.fail_creates.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected create failure"));
        }
        if self.contains(key) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        Ok(MemoryEntry {
            key: key.clone(),
            data: EntryData::default(),
            shared: self.shared.clone(),
            // an entry that was created is committed even if nothing was written to it
            dirty: true,
            doomed: false,
        })
    }

    fn doom_entry(&mut self, key: &CacheKey) -> io::Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// An [`Entry`] of the [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryEntry {
    key: CacheKey,
    data: EntryData,
    shared: Arc<Shared>,
    dirty: bool,
    doomed: bool,
}

impl Entry for MemoryEntry {
    fn key(&self) -> &CacheKey {
        &self.key
    }

    fn data_size(&self, stream: DataStream) -> usize {
        self.data.stream(stream).len()
    }

    fn read_data(&self, stream: DataStream, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.data.read(stream, offset, buf))
    }

    fn write_data(
        &mut self,
        stream: DataStream,
        offset: usize,
        data: &[u8],
        truncate: bool,
    ) -> io::Result<usize> {
        self.dirty = true;
        Ok(self.data.write(stream, offset, data, truncate))
    }

    fn doom(&mut self) {
        if !self.doomed {
            self.doomed = true;
            self.shared.entries().remove(&self.key);
        }
    }

    fn close(self) -> io::Result<()> {
        if self.dirty && !self.doomed {
            self.shared.entries().insert(self.key, self.data);
        }
        Ok(())
    }
}
