//! Local content-addressed artifact store.
//!
//! A flat directory of `KEY.KIND.NAME` tarballs with `KEY.build-log` and
//! `KEY.meta` sidecars. Writers go through `claim -> commit|abort`: the
//! claim holds an advisory lock on `KEY.lock`, stages everything as
//! `.partial` files, and commit renames them into place atomically. The
//! lock dies with the process; after a crash or reboot the presence of the
//! final files is what counts, and stale partials are swept by the next
//! claimant.

use crate::error::{CacheError, CacheResult};
use crate::{CacheFilename, artifact_filename, build_log_filename, meta_filename};
use fs4::FileExt;
use morph_core::{ArtifactKind, CacheKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Metadata stored next to each artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub cache_key: CacheKey,
    pub kind: ArtifactKind,
    /// Name of the morphology the unit came from.
    pub source_name: String,
    pub repo: String,
    pub sha1: String,
    /// Artifact names committed under this key.
    pub artifacts: Vec<String>,
    pub dependency_keys: Vec<CacheKey>,
    #[serde(with = "time::serde::rfc3339")]
    pub build_started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub build_ended: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_access: OffsetDateTime,
}

/// Outcome of a claim attempt.
pub enum ClaimOutcome {
    /// The artifact group is already committed.
    Done,
    /// Another holder is writing this key right now.
    Busy,
    /// Exclusive write rights granted.
    Claimed(Claim),
}

/// Exclusive write rights for one cache key.
///
/// Stage files through the `*_partial` methods, then `commit()`. Dropping
/// an uncommitted claim aborts it, which keeps any staged build log (the
/// log must survive failure) and deletes everything else.
pub struct Claim {
    dir: PathBuf,
    key: CacheKey,
    // Held for the lifetime of the claim; the advisory lock is released
    // when the file is dropped, or by the OS on process exit.
    _lock: File,
    staged: Vec<String>,
    finished: bool,
}

impl Claim {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    fn stage(&mut self, filename: String) -> PathBuf {
        let path = self.dir.join(format!("{filename}.partial"));
        if !self.staged.contains(&filename) {
            self.staged.push(filename);
        }
        path
    }

    /// Path to stage an artifact tarball at.
    pub fn artifact_partial(&mut self, kind: ArtifactKind, name: &str) -> PathBuf {
        let filename = artifact_filename(&self.key, kind, name);
        self.stage(filename)
    }

    /// Path to stage the build log at.
    pub fn build_log_partial(&mut self) -> PathBuf {
        let filename = build_log_filename(&self.key);
        self.stage(filename)
    }

    /// Path to stage an arbitrary validated cache file at.
    pub fn partial_for(&mut self, filename: &CacheFilename) -> PathBuf {
        self.stage(filename.to_filename())
    }

    /// Stage the metadata sidecar.
    pub fn write_meta(&mut self, meta: &ArtifactMeta) -> CacheResult<()> {
        let filename = meta_filename(&self.key);
        let path = self.stage(filename);
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Atomically publish every staged file.
    ///
    /// Sidecars are renamed before artifacts so that a visible artifact
    /// always has its build log and metadata next to it.
    pub fn commit(mut self) -> CacheResult<()> {
        let mut ordered = self.staged.clone();
        ordered.sort_by_key(|filename| {
            match CacheFilename::parse(filename) {
                Ok(CacheFilename::BuildLog { .. }) => 0,
                Ok(CacheFilename::Meta { .. }) => 1,
                _ => 2,
            }
        });
        for filename in &ordered {
            let partial = self.dir.join(format!("{filename}.partial"));
            let target = self.dir.join(filename);
            if partial.exists() {
                fs::rename(&partial, &target)?;
            }
        }
        tracing::debug!(key = %self.key, files = ordered.len(), "artifact committed");
        self.finished = true;
        Ok(())
    }

    /// Drop staged files, preserving the build log.
    pub fn abort(mut self) -> CacheResult<()> {
        self.abort_inner()?;
        self.finished = true;
        Ok(())
    }

    fn abort_inner(&self) -> CacheResult<()> {
        for filename in &self.staged {
            let partial = self.dir.join(format!("{filename}.partial"));
            if !partial.exists() {
                continue;
            }
            if matches!(
                CacheFilename::parse(filename),
                Ok(CacheFilename::BuildLog { .. })
            ) {
                fs::rename(&partial, self.dir.join(filename))?;
            } else {
                fs::remove_file(&partial)?;
            }
        }
        tracing::debug!(key = %self.key, "claim aborted");
        Ok(())
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.abort_inner() {
                tracing::warn!(key = %self.key, error = %err, "abort on drop failed");
            }
        }
    }
}

/// Statistics from a GC run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub groups_deleted: usize,
    pub bytes_freed: u64,
}

/// The local artifact store.
pub struct LocalArtifactCache {
    dir: PathBuf,
}

impl LocalArtifactCache {
    /// Open (creating if needed) the store at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.path_of(&meta_filename(key))
    }

    /// Whether the artifact tarball exists.
    pub fn has(&self, key: &CacheKey, kind: ArtifactKind, name: &str) -> bool {
        self.path_of(&artifact_filename(key, kind, name)).exists()
    }

    /// Whether the key group has been committed.
    pub fn is_built(&self, key: &CacheKey) -> bool {
        self.meta_path(key).exists()
    }

    /// Whether a write is currently in flight for the key.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        let lock_path = self.path_of(&format!("{}.lock", key.to_hex()));
        let Ok(file) = OpenOptions::new().write(true).open(&lock_path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    /// Open an artifact for reading, bumping its `last_access`.
    pub fn open_for_read(
        &self,
        key: &CacheKey,
        kind: ArtifactKind,
        name: &str,
    ) -> CacheResult<File> {
        let path = self.path_of(&artifact_filename(key, kind, name));
        let file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound(artifact_filename(key, kind, name))
            } else {
                CacheError::Io(err)
            }
        })?;
        if let Ok(mut meta) = self.read_meta(key) {
            meta.last_access = OffsetDateTime::now_utc();
            let _ = self.write_meta_in_place(&meta);
        }
        Ok(file)
    }

    /// Read the metadata sidecar.
    pub fn read_meta(&self, key: &CacheKey) -> CacheResult<ArtifactMeta> {
        let path = self.meta_path(key);
        let text = fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound(meta_filename(key))
            } else {
                CacheError::Io(err)
            }
        })?;
        serde_json::from_str(&text).map_err(|e| CacheError::Corrupt(e.to_string()))
    }

    fn write_meta_in_place(&self, meta: &ArtifactMeta) -> CacheResult<()> {
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let tmp = self.path_of(&format!("{}.meta.tmp", meta.cache_key.to_hex()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.meta_path(&meta.cache_key))?;
        Ok(())
    }

    /// Read the build log.
    pub fn read_build_log(&self, key: &CacheKey) -> CacheResult<String> {
        let path = self.path_of(&build_log_filename(key));
        fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound(build_log_filename(key))
            } else {
                CacheError::Io(err)
            }
        })
    }

    /// Try to acquire exclusive write rights for `key`.
    ///
    /// `Done` if the group is already committed, `Busy` if another holder
    /// is active, `Claimed` otherwise. Stale partials from a crashed
    /// previous holder are swept on acquisition.
    pub fn claim(&self, key: &CacheKey) -> CacheResult<ClaimOutcome> {
        if self.is_built(key) {
            return Ok(ClaimOutcome::Done);
        }
        let lock_path = self.path_of(&format!("{}.lock", key.to_hex()));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Ok(ClaimOutcome::Busy);
        }
        // Re-check now that the lock is held; another process may have
        // committed between the first check and the lock.
        if self.is_built(key) {
            let _ = lock.unlock();
            return Ok(ClaimOutcome::Done);
        }
        self.sweep_partials(key)?;
        Ok(ClaimOutcome::Claimed(Claim {
            dir: self.dir.clone(),
            key: *key,
            _lock: lock,
            staged: Vec::new(),
            finished: false,
        }))
    }

    fn sweep_partials(&self, key: &CacheKey) -> CacheResult<()> {
        let prefix = format!("{}.", key.to_hex());
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if filename.starts_with(&prefix) && filename.ends_with(".partial") {
                tracing::debug!(file = %filename, "sweeping stale partial");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// All committed keys.
    pub fn list_keys(&self) -> CacheResult<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if let Ok(CacheFilename::Meta { key }) = CacheFilename::parse(&filename) {
                keys.push(key);
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// Trim the store to at most `max_total_bytes`, deleting whole key
    /// groups least-recently-accessed first. Keys with an in-flight claim
    /// are skipped; partial files never count as a group of their own.
    pub fn gc(&self, max_total_bytes: u64) -> CacheResult<GcStats> {
        let mut groups: BTreeMap<String, (Vec<PathBuf>, u64)> = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(key_hex) = filename.split('.').next() else {
                continue;
            };
            if key_hex.len() != 64 {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let group = groups.entry(key_hex.to_string()).or_default();
            group.0.push(entry.path());
            group.1 += size;
        }

        let mut total: u64 = groups.values().map(|(_, size)| size).sum();
        let mut order: Vec<(OffsetDateTime, String)> = groups
            .keys()
            .map(|key_hex| {
                let accessed = CacheKey::from_hex(key_hex)
                    .ok()
                    .and_then(|key| self.read_meta(&key).ok())
                    .map(|meta| meta.last_access)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                (accessed, key_hex.clone())
            })
            .collect();
        order.sort();

        let mut stats = GcStats::default();
        for (_, key_hex) in order {
            if total <= max_total_bytes {
                break;
            }
            if let Ok(key) = CacheKey::from_hex(&key_hex) {
                if self.is_in_flight(&key) {
                    continue;
                }
            }
            let (paths, size) = &groups[&key_hex];
            for path in paths {
                fs::remove_file(path)?;
            }
            total -= size;
            stats.groups_deleted += 1;
            stats.bytes_freed += size;
            tracing::info!(key = %key_hex, bytes = size, "evicted artifact group");
        }
        Ok(stats)
    }
}
