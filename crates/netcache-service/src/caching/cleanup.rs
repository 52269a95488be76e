use std::fs::{read_dir, remove_dir, remove_file};
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::config::Config;
use crate::metric;

use super::FsBackend;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This will clean up the on-disk cache based on the configured retention.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let backend = FsBackend::from_config(&config)?.ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    backend.cleanup(dry_run)
}

#[derive(Debug, Default)]
struct CleanupStats {
    removed_dirs: usize,
    removed_files: usize,
    removed_bytes: u64,

    retained_dirs: usize,
    retained_files: usize,
    retained_bytes: u64,
}

impl FsBackend {
    /// Cleans up this cache based on configured cache retention.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        tracing::info!("Cleaning up `{}`", self.cache_dir().display());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(self.cache_dir(), &mut stats, dry_run)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("http_cache.size.files") = stats.retained_files as u64);
        metric!(gauge("http_cache.size.bytes") = stats.retained_bytes);
        metric!(counter("http_cache.size.files_removed") += stats.removed_files as i64);
        metric!(counter("http_cache.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(())
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            tracing::warn!("Directory not found: `{}`", directory.display());
            return Ok(true);
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats, dry_run: bool) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        if catch_not_found(|| self.check_expiry(path))?.is_none() {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }
}
