use std::io;

use super::CacheKey;

/// The data streams of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataStream {
    /// The serialized [`ResponseInfo`](crate::transaction::ResponseInfo).
    ResponseInfo,
    /// The response body.
    ResponseContent,
}

impl DataStream {
    fn index(self) -> usize {
        match self {
            Self::ResponseInfo => 0,
            Self::ResponseContent => 1,
        }
    }
}

/// An opaque entry of a disk cache [`Backend`].
///
/// An entry is opened once per activation and shared by all transactions attached to it, so
/// writes are immediately visible to later reads on the same handle. Whether and when written
/// data becomes visible to a later [`Backend::open_entry`] is up to the backend, but it must not
/// happen for an entry that was [doomed](Self::doom).
pub trait Entry {
    /// The key this entry was opened or created for.
    fn key(&self) -> &CacheKey;

    /// Returns the current size of the given stream.
    fn data_size(&self, stream: DataStream) -> usize;

    /// Reads from `stream` at `offset` into `buf`, returning the number of bytes read.
    fn read_data(&self, stream: DataStream, offset: usize, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `data` into `stream` at `offset`, returning the number of bytes written.
    ///
    /// With `truncate`, the stream ends right after the written data.
    fn write_data(
        &mut self,
        stream: DataStream,
        offset: usize,
        data: &[u8],
        truncate: bool,
    ) -> io::Result<usize>;

    /// Marks the entry for deletion.
    ///
    /// The handle stays usable, but its contents are discarded once it is closed.
    fn doom(&mut self);

    /// Releases the handle.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// A disk cache backend, handing out [`Entry`] handles by [`CacheKey`].
pub trait Backend {
    type Entry: Entry;

    /// Opens the existing entry for `key`, or `None` if there is none.
    fn open_entry(&mut self, key: &CacheKey) -> io::Result<Option<Self::Entry>>;

    /// Creates a new entry for `key`, failing if one already exists.
    fn create_entry(&mut self, key: &CacheKey) -> io::Result<Self::Entry>;

    /// Deletes the stored entry for `key`, if any.
    fn doom_entry(&mut self, key: &CacheKey) -> io::Result<()>;
}

/// The in-memory contents of an entry, shared by the backend implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EntryData {
    streams: [Vec<u8>; 2],
}

impl EntryData {
    pub fn from_streams(info: Vec<u8>, content: Vec<u8>) -> Self {
        Self {
            streams: [info, content],
        }
    }

    pub fn stream(&self, stream: DataStream) -> &[u8] {
        &self.streams[stream.index()]
    }

    pub fn read(&self, stream: DataStream, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.stream(stream);
        if offset >= data.len() {
            return 0;
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        len
    }

    pub fn write(&mut self, stream: DataStream, offset: usize, data: &[u8], truncate: bool) -> usize {
        let buf = &mut self.streams[stream.index()];
        let end = offset + data.len();
        // writing past the end leaves a zero-filled gap
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        if truncate {
            buf.truncate(end);
        }
        data.len()
    }
}
