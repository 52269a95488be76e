use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{CacheConfig, Config};
use crate::metric;

use super::backend::EntryData;
use super::{Backend, CacheKey, DataStream, Entry};

/// The version of the on-disk entry format, which is part of every entry path.
pub const CACHE_VERSION: u32 = 1;

/// The interval in which used entries should be touched.
///
/// Entries use a "time to idle" mode, so we need to regularly "touch" the files to signal that
/// they are still in use. This is being debounced to once every hour to not have to touch them on
/// every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// Prefix of every entry file.
const ENTRY_MAGIC: &[u8; 4] = b"nce1";

/// A [`Backend`] persisting entries on the file system.
///
/// Every entry lives in a single file at the hashed [`CacheKey::cache_path`] below the cache
/// directory. Files are only ever replaced atomically: new contents are written to a temporary
/// file in a sibling directory, which is then moved into place when the entry is closed.
#[derive(Debug, Clone)]
pub struct FsBackend {
    /// Directory to use for storing entries.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    tmp_dir: PathBuf,

    /// Options intended to be user-configurable.
    cache_config: CacheConfig,
}

impl FsBackend {
    /// Creates the backend configured by `config`, or `None` if no cache directory is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match (config.cache_dir("http"), config.cache_dir("tmp")) {
            (Some(cache_dir), Some(tmp_dir)) => {
                Self::new(cache_dir, tmp_dir, config.caches).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Creates a backend, creating the directories if they do not exist yet.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        cache_config: CacheConfig,
    ) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        let tmp_dir = tmp_dir.into();
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            cache_config,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path of the file storing the entry for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path(CACHE_VERSION))
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which survive a
    /// hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Validate cache expiration of path.
    ///
    /// If the entry should not be used anymore, `Err(io::ErrorKind::NotFound)` is returned.
    /// Otherwise `Ok(touch_in)` tells how long until the file should be touched again.
    pub(super) fn check_expiry(&self, path: &Path) -> io::Result<Duration> {
        // `mtime` keeps track of "last used", because every other filesystem attribute is
        // unreliable:
        // * creation time does not exist pre-Linux 4.11
        // * most filesystems are mounted with noatime
        let metadata = path.metadata()?;
        tracing::trace!("File `{}` length: {}", path.display(), metadata.len());

        let mtime_elapsed = metadata.modified()?.elapsed().unwrap_or_default();
        let max_unused_for = self.cache_config.max_unused_for.unwrap_or(Duration::MAX);
        if mtime_elapsed > max_unused_for {
            return Err(io::ErrorKind::NotFound.into());
        }

        Ok(TOUCH_EVERY.saturating_sub(mtime_elapsed))
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn load(&self, path: &Path) -> io::Result<Option<EntryData>> {
        let touch_in = match catch_not_found(|| self.check_expiry(path))? {
            Some(touch_in) => touch_in,
            None => {
                // expired entries are removed right away, so they can be created again
                catch_not_found(|| fs::remove_file(path))?;
                return Ok(None);
            }
        };

        let Some(bytes) = catch_not_found(|| fs::read(path))? else {
            return Ok(None);
        };

        let data = match decode_entry(&bytes) {
            Ok(data) => data,
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
                tracing::warn!(
                    error = dynerr,
                    "Discarding unreadable cache file `{}`",
                    path.display()
                );
                catch_not_found(|| fs::remove_file(path))?;
                return Ok(None);
            }
        };

        if touch_in == Duration::ZERO {
            tracing::trace!("Touching `{}`", path.display());
            filetime::set_file_mtime(path, FileTime::now())?;
        }

        metric!(time_raw("http_cache.file.size") = bytes.len() as u64);
        Ok(Some(data))
    }
}

impl Backend for FsBackend {
    type Entry = FsEntry;

    fn open_entry(&mut self, key: &CacheKey) -> io::Result<Option<FsEntry>> {
        let path = self.entry_path(key);
        let entry = self.load(&path)?.map(|data| FsEntry {
            key: key.clone(),
            path,
            data,
            backend: self.clone(),
            dirty: false,
            doomed: false,
        });
        Ok(entry)
    }

    fn create_entry(&mut self, key: &CacheKey) -> io::Result<FsEntry> {
        let path = self.entry_path(key);
        if catch_not_found(|| self.check_expiry(&path))?.is_some() {
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        Ok(FsEntry {
            key: key.clone(),
            path,
            data: EntryData::default(),
            backend: self.clone(),
            dirty: true,
            doomed: false,
        })
    }

    fn doom_entry(&mut self, key: &CacheKey) -> io::Result<()> {
        let path = self.entry_path(key);
        catch_not_found(|| fs::remove_file(&path))?;
        Ok(())
    }
}

/// An [`Entry`] of the [`FsBackend`].
///
/// The contents are held in memory while the entry is open and written out when it is closed.
#[derive(Debug)]
pub struct FsEntry {
    key: CacheKey,
    path: PathBuf,
    data: EntryData,
    backend: FsBackend,
    dirty: bool,
    doomed: bool,
}

impl FsEntry {
    /// The path of the file backing this entry.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Entry for FsEntry {
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
        if self.doomed {
            return;
        }
        self.doomed = true;
        if let Err(e) = catch_not_found(|| fs::remove_file(&self.path)) {
            sentry::with_scope(
                |scope| scope.set_extra("path", self.path.display().to_string().into()),
                || tracing::error!("Failed to remove doomed cache file: {:?}", e),
            );
        }
    }

    fn close(self) -> io::Result<()> {
        if !self.dirty || self.doomed {
            return Ok(());
        }

        let mut temp_file = self.backend.tempfile()?;
        let bytes = encode_entry(&self.data);
        io::Write::write_all(&mut temp_file, &bytes)?;
        persist_tempfile(temp_file, &self.path)?;

        metric!(counter("http_cache.file.write") += 1);
        metric!(time_raw("http_cache.file.size") = bytes.len() as u64);
        Ok(())
    }
}

fn encode_entry(data: &EntryData) -> Vec<u8> {
    let info = data.stream(DataStream::ResponseInfo);
    let content = data.stream(DataStream::ResponseContent);

    let mut bytes = Vec::with_capacity(ENTRY_MAGIC.len() + 8 + info.len() + content.len());
    bytes.extend_from_slice(ENTRY_MAGIC);
    bytes.extend_from_slice(&(info.len() as u64).to_le_bytes());
    bytes.extend_from_slice(info);
    bytes.extend_from_slice(content);
    bytes
}

fn decode_entry(bytes: &[u8]) -> io::Result<EntryData> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "malformed cache entry");

    let rest = bytes.strip_prefix(ENTRY_MAGIC).ok_or_else(invalid)?;
    let (len, rest) = rest.split_first_chunk::<8>().ok_or_else(invalid)?;
    let info_len = usize::try_from(u64::from_le_bytes(*len)).map_err(|_| invalid())?;
    if info_len > rest.len() {
        return Err(invalid());
    }
    let (info, content) = rest.split_at(info_len);

    Ok(EntryData::from_streams(info.to_vec(), content.to_vec()))
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // The `cleanup` process could potentially remove the parent directories we are
    // operating in, so be defensive here and retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    };
    Ok(file)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
