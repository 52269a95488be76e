//! # Disk cache backends
//!
//! The [`HttpCache`](crate::http_cache::HttpCache) coordinates transactions, but it does not store
//! anything itself. Storage is delegated to a [`Backend`], which hands out opaque [`Entry`]
//! handles keyed by [`CacheKey`].
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] identifies a cacheable resource. It is derived from the request method, the
//! URL (without fragment), an optional upload identifier, and a canonicalized set of request
//! headers. It contains human-readable metadata like `GET:http://x/`, which is SHA256-hashed to
//! form the path of the entry on the file system.
//!
//! **NOTE**: Care must be taken to make sure that this metadata is stable, as it would otherwise
//! lead to bad cache reuse across restarts.
//!
//! ## Entries
//!
//! An [`Entry`] has two [`DataStream`]s: the serialized response info, and the response content.
//! Both support byte-range reads and writes. An entry is opened once when it becomes active and
//! is shared by all transactions using it.
//!
//! Entries can be *doomed*. A doomed entry stays usable for whoever holds it, but its contents are
//! thrown away once it is closed, and it can no longer be opened.
//!
//! ## Backends
//!
//! - [`FsBackend`] persists entries below the configured `cache_dir`. Data is written to a
//!   temporary file and atomically moved into place when the entry is closed. Entries that have
//!   not been used for `caches.max_unused_for` are considered missing, and are removed by the
//!   [`cleanup`] command.
//! - [`MemoryBackend`] keeps committed entries in memory. It is used when no `cache_dir` is
//!   configured, and in tests.
//!
//! ### Metrics
//!
//! - `http_cache.file.write`: The number of entries being written to disk.
//! - `http_cache.file.size`: A histogram for the size (in bytes) of entry files that are loaded or
//!   written.
//! - `http_cache.size.*`: Gauges and counters emitted by [`cleanup`].

mod backend;
mod cache_error;
mod cache_key;
mod cleanup;
mod fs;
mod memory;

pub use backend::{Backend, DataStream, Entry};
pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use cleanup::cleanup;
pub use fs::{CACHE_VERSION, FsBackend, FsEntry};
pub use memory::{MemoryBackend, MemoryEntry};
