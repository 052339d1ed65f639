//! Disk-backed cache of rendered formula fragments.
//!
//! The directory is the only source of truth: there is no in-memory index, and
//! other processes (or an operator) may delete entries at any time. Every
//! read, write and delete therefore stands on its own and treats "already
//! gone" as a normal outcome rather than an error.

use std::{
    cmp::Ordering,
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use metrics::counter;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::Fingerprint;

pub const CACHE_EXTENSION: &str = "html";
const TEMP_PREFIX: &str = ".render-";
const TEMP_SUFFIX: &str = ".partial";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
/// Staging files older than this belong to a writer that died before `persist`.
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum RenderCacheError {
    #[error("failed to prepare cache directory `{}`: {source}", path.display())]
    Init {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Bounds enforced by one eviction sweep. Supplied by the caller per sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_entries: usize,
    pub max_total_bytes: u64,
    pub max_age: Duration,
}

impl EvictionPolicy {
    pub fn new(max_entries: usize, max_total_bytes: u64, max_age_days: u64) -> Self {
        Self {
            max_entries,
            max_total_bytes,
            max_age: Duration::from_secs(max_age_days.saturating_mul(SECONDS_PER_DAY)),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Entries visible when the sweep listed the directory.
    pub scanned: usize,
    /// Listed, but gone before their metadata could be read.
    pub vanished_during_scan: usize,
    pub removed_expired: usize,
    pub removed_over_bounds: usize,
    /// Deletes that found the file already removed by someone else.
    pub already_gone: usize,
    /// Deletes that failed for reasons other than the file being gone.
    pub failed: usize,
    /// Abandoned `.partial` staging files cleared alongside the entries.
    pub removed_staging: usize,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

impl EvictionReport {
    /// Entries this sweep accounts as deleted, including ones another agent beat it to.
    pub fn removed(&self) -> usize {
        self.removed_expired + self.removed_over_bounds + self.already_gone
    }
}

/// One cached fragment, as observed on disk at sweep time.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) key: Fingerprint,
    pub(crate) path: PathBuf,
    pub(crate) size_bytes: u64,
    pub(crate) modified: SystemTime,
}

/// Directory listing captured at the start of a sweep.
#[derive(Debug, Default)]
pub(crate) struct CacheScan {
    pub(crate) entries: Vec<CacheEntry>,
    pub(crate) vanished: usize,
    /// Staging files with their mtime; never counted against the bounds.
    pub(crate) staging: Vec<(PathBuf, SystemTime)>,
}

enum Removal {
    Removed,
    AlreadyGone,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RenderCache {
    dir: PathBuf,
}

impl RenderCache {
    /// Open (creating if needed) the cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RenderCacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RenderCacheError::Init {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{key}.{CACHE_EXTENSION}"))
    }

    /// Read a cached fragment. Unreadable or missing entries are a miss.
    pub fn get(&self, key: &Fingerprint) -> Option<String> {
        let path = self.entry_path(key);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                counter!("mathexport_render_cache_hit_total").increment(1);
                Some(contents)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                counter!("mathexport_render_cache_miss_total").increment(1);
                None
            }
            Err(err) => {
                counter!("mathexport_render_cache_miss_total").increment(1);
                warn!(
                    target = "application::render::cache",
                    op = "render_cache::get",
                    result = "read_error",
                    cache_path = %path.display(),
                    error = %err,
                    "Failed to read cached fragment; treating as miss"
                );
                None
            }
        }
    }

    /// Write a fragment. The file appears atomically: readers see either the
    /// previous complete entry or the new complete entry. Concurrent writers of
    /// the same key race harmlessly (last rename wins, contents are identical).
    pub fn put(&self, key: &Fingerprint, contents: &str) -> io::Result<()> {
        let mut staged = match self.stage() {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // The whole directory was removed underneath us.
                fs::create_dir_all(&self.dir)?;
                self.stage()?
            }
            Err(err) => return Err(err),
        };
        staged.write_all(contents.as_bytes())?;
        staged.flush()?;
        staged
            .persist(self.entry_path(key))
            .map(|_| ())
            .map_err(|err| err.error)
    }

    fn stage(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
    }

    /// Delete entries until the cache satisfies `policy`, oldest first.
    ///
    /// Entries modified at or after the moment the sweep starts are never
    /// deleted by it, so a sweep cannot chase fragments rendered while it runs
    /// and always terminates, even when a bound is unreachable.
    pub fn evict(&self, policy: &EvictionPolicy) -> EvictionReport {
        let started_at = Instant::now();
        let baseline = SystemTime::now();
        let scan = self.scan();
        let report = self.sweep(scan, policy, baseline);

        counter!("mathexport_render_cache_evict_total").increment(report.removed() as u64);
        info!(
            target = "application::render::cache",
            op = "render_cache::evict",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            cache_dir = %self.dir.display(),
            scanned = report.scanned,
            removed_expired = report.removed_expired,
            removed_over_bounds = report.removed_over_bounds,
            already_gone = report.already_gone,
            failed = report.failed,
            removed_staging = report.removed_staging,
            remaining_entries = report.remaining_entries,
            remaining_bytes = report.remaining_bytes,
            "Render cache eviction sweep completed"
        );
        report
    }

    pub(crate) fn scan(&self) -> CacheScan {
        let mut scan = CacheScan::default();
        let listing = match fs::read_dir(&self.dir) {
            Ok(listing) => listing,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(
                        target = "application::render::cache",
                        op = "render_cache::scan",
                        result = "list_error",
                        cache_dir = %self.dir.display(),
                        error = %err,
                        "Failed to list render cache directory"
                    );
                }
                return scan;
            }
        };

        for dir_entry in listing {
            let Ok(dir_entry) = dir_entry else {
                scan.vanished += 1;
                continue;
            };
            let path = dir_entry.path();
            if is_staging_file(&path) {
                if let Ok(modified) = dir_entry.metadata().and_then(|meta| meta.modified()) {
                    scan.staging.push((path, modified));
                }
                continue;
            }
            let Some(key) = cache_key_for(&path) else {
                continue;
            };
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    if err.kind() != ErrorKind::NotFound {
                        debug!(
                            target = "application::render::cache",
                            op = "render_cache::scan",
                            cache_path = %path.display(),
                            error = %err,
                            "Skipping cache entry with unreadable metadata"
                        );
                    }
                    scan.vanished += 1;
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            scan.entries.push(CacheEntry {
                key,
                path,
                size_bytes: metadata.len(),
                modified,
            });
        }

        scan
    }

    pub(crate) fn sweep(
        &self,
        scan: CacheScan,
        policy: &EvictionPolicy,
        baseline: SystemTime,
    ) -> EvictionReport {
        let mut report = EvictionReport {
            scanned: scan.entries.len() + scan.vanished,
            vanished_during_scan: scan.vanished,
            remaining_entries: scan.entries.len(),
            remaining_bytes: scan.entries.iter().map(|entry| entry.size_bytes).sum(),
            ..EvictionReport::default()
        };

        for (path, modified) in &scan.staging {
            let age = baseline.duration_since(*modified).unwrap_or(Duration::ZERO);
            if age <= STALE_STAGING_AGE {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => report.removed_staging += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!(
                    target = "application::render::cache",
                    op = "render_cache::evict",
                    result = "staging_delete_error",
                    cache_path = %path.display(),
                    error = %err,
                    "Failed to delete abandoned staging file"
                ),
            }
        }

        let mut candidates: Vec<CacheEntry> = scan
            .entries
            .into_iter()
            .filter(|entry| entry.modified < baseline)
            .collect();
        candidates.sort_by(oldest_first);

        let (expired, live): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|entry| age_at(baseline, entry) > policy.max_age);

        for entry in &expired {
            match remove_entry(entry) {
                Removal::Removed => report.removed_expired += 1,
                Removal::AlreadyGone => report.already_gone += 1,
                Removal::Failed => {
                    report.failed += 1;
                    continue;
                }
            }
            release(&mut report, entry);
        }

        for entry in &live {
            if within_bounds(&report, policy) {
                break;
            }
            match remove_entry(entry) {
                Removal::Removed => report.removed_over_bounds += 1,
                Removal::AlreadyGone => report.already_gone += 1,
                Removal::Failed => {
                    report.failed += 1;
                    continue;
                }
            }
            release(&mut report, entry);
        }

        report
    }
}

fn cache_key_for(path: &Path) -> Option<Fingerprint> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(CACHE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(Fingerprint::from_hex)
}

fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
}

fn oldest_first(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key))
}

fn age_at(baseline: SystemTime, entry: &CacheEntry) -> Duration {
    baseline
        .duration_since(entry.modified)
        .unwrap_or(Duration::ZERO)
}

fn within_bounds(report: &EvictionReport, policy: &EvictionPolicy) -> bool {
    report.remaining_entries <= policy.max_entries
        && report.remaining_bytes <= policy.max_total_bytes
}

fn release(report: &mut EvictionReport, entry: &CacheEntry) {
    report.remaining_entries = report.remaining_entries.saturating_sub(1);
    report.remaining_bytes = report.remaining_bytes.saturating_sub(entry.size_bytes);
}

fn remove_entry(entry: &CacheEntry) -> Removal {
    match fs::remove_file(&entry.path) {
        Ok(()) => Removal::Removed,
        Err(err) if err.kind() == ErrorKind::NotFound => Removal::AlreadyGone,
        Err(err) => {
            warn!(
                target = "application::render::cache",
                op = "render_cache::evict",
                result = "delete_error",
                cache_path = %entry.path.display(),
                error = %err,
                "Failed to delete cache entry; leaving it in place"
            );
            Removal::Failed
        }
    }
}
