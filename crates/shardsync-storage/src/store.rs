//! Per-shard segment store
//!
//! On-disk layout of one shard:
//!
//! ```text
//! <data_dir>/<index>/<shard>/
//!     checkpoint.json           last committed checkpoint
//!     <file>.<checksum>         segment files named by the checkpoint
//!     .staging/<label>/<file>   files received for an uncommitted attempt
//! ```
//!
//! Readers pin a [`SegmentView`]. A commit swaps the current view
//! atomically; files it supersedes stay on disk until the last view that
//! references them is dropped, and their cached bytes are invalidated at
//! the same time.
//!
//! Each physical path has at most one live owner. A commit that brings back
//! a file an older pinned view still holds adopts that owner instead of
//! writing over its path.

use crate::cache::{CacheHandle, RefCountedCache};
use crate::metadata::{
    validate_file_name, MetadataSnapshot, ReplicationCheckpoint, StoreFileMetadata,
};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use shardsync_common::{Checksum, ChecksumCalculator, Error, Result, ShardId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_TMP: &str = "checkpoint.json.tmp";
const STAGING_DIR: &str = ".staging";

/// Cache key for a segment file's contents
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentCacheKey {
    pub shard: ShardId,
    pub file: String,
    pub checksum: Checksum,
}

/// The node-wide cache of segment file contents
pub type SegmentCache = RefCountedCache<SegmentCacheKey, Bytes>;

/// A pinned reference to cached segment file contents
pub type SegmentHandle = CacheHandle<SegmentCacheKey, Bytes>;

/// Physical location of a segment file. Contents are part of the name so a
/// file replaced under the same logical name never collides with the copy
/// older readers still use.
fn data_path(dir: &Path, meta: &StoreFileMetadata) -> PathBuf {
    dir.join(format!("{}.{}", meta.name(), meta.checksum().to_hex()))
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn verify_contents(meta: &StoreFileMetadata, data: &[u8]) -> Result<()> {
    if data.len() as u64 != meta.length() {
        return Err(Error::LengthMismatch {
            file: meta.name().to_string(),
            expected: meta.length(),
            actual: data.len() as u64,
        });
    }
    let actual = Checksum::compute(data);
    if actual != meta.checksum() {
        return Err(Error::ChecksumMismatch {
            file: meta.name().to_string(),
            expected: meta.checksum().to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Owner of every segment file path of one shard
type FileRegistry = Arc<Mutex<HashMap<PathBuf, Weak<SegmentFile>>>>;

/// A committed segment file, shared by every view that includes it
struct SegmentFile {
    meta: StoreFileMetadata,
    path: PathBuf,
    cache_key: SegmentCacheKey,
    cache: SegmentCache,
    registry: FileRegistry,
    /// Set when a commit supersedes the file
    obsolete: AtomicBool,
}

impl SegmentFile {
    /// The caller records the file in `registry`
    fn new(
        shard: &ShardId,
        meta: StoreFileMetadata,
        path: PathBuf,
        cache: SegmentCache,
        registry: &FileRegistry,
    ) -> Self {
        let cache_key = SegmentCacheKey {
            shard: shard.clone(),
            file: meta.name().to_string(),
            checksum: meta.checksum(),
        };
        Self {
            meta,
            path,
            cache_key,
            cache,
            registry: Arc::clone(registry),
            obsolete: AtomicBool::new(false),
        }
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        // A later commit re-created this path under a new owner
        if registry
            .get(&self.path)
            .is_some_and(|owner| owner.strong_count() > 0)
        {
            return;
        }
        registry.remove(&self.path);
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        self.cache.invalidate(&self.cache_key);
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Deleted superseded segment file {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete superseded segment file {:?}: {}", self.path, e),
        }
    }
}

/// Point-in-time view of a shard's committed segment files
pub struct SegmentView {
    checkpoint: ReplicationCheckpoint,
    files: BTreeMap<String, Arc<SegmentFile>>,
}

impl SegmentView {
    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        &self.checkpoint
    }

    pub fn metadata(&self) -> &MetadataSnapshot {
        self.checkpoint.files()
    }

    pub fn file(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.files.get(name).map(|f| &f.meta)
    }

    /// On-disk path of a file in this view
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(|f| f.path.as_path())
    }

    /// Read a file's full contents through the node-wide cache. Contents
    /// are verified against the file's checksum when loaded.
    pub async fn read_file(&self, name: &str) -> Result<SegmentHandle> {
        let file = self.files.get(name).ok_or_else(|| Error::FileNotFound {
            shard: self.checkpoint.shard_id().to_string(),
            file: name.to_string(),
        })?;

        let path = file.path.clone();
        let meta = file.meta.clone();
        file.cache
            .acquire(file.cache_key.clone(), || async move {
                let data = tokio::fs::read(&path).await?;
                verify_contents(&meta, &data)?;
                Ok(Bytes::from(data))
            })
            .await
    }
}

impl std::fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentView")
            .field("checkpoint", &self.checkpoint.to_string())
            .finish()
    }
}

/// Segment store for one shard copy
pub struct ShardStore {
    shard_id: ShardId,
    dir: PathBuf,
    cache: SegmentCache,
    current: RwLock<Arc<SegmentView>>,
    files: FileRegistry,
    /// Serializes commits
    commit_lock: Mutex<()>,
}

impl ShardStore {
    /// Open (or create) the store for `shard_id` under `data_dir`.
    ///
    /// Leftover staging directories and files not named by the committed
    /// checkpoint are removed.
    pub fn open(data_dir: &Path, shard_id: ShardId, cache: SegmentCache) -> Result<Self> {
        let dir = data_dir.join(shard_id.relative_path());
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to create shard dir {:?}: {}", dir, e)))?;

        let staging = dir.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
            debug!("Removed leftover staging area {:?}", staging);
        }

        let checkpoint = match fs::read(dir.join(CHECKPOINT_FILE)) {
            Ok(raw) => serde_json::from_slice::<ReplicationCheckpoint>(&raw).map_err(|e| {
                Error::Deserialization(format!("corrupt checkpoint in {:?}: {}", dir, e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => ReplicationCheckpoint::empty(shard_id.clone()),
            Err(e) => return Err(e.into()),
        };
        if checkpoint.shard_id() != &shard_id {
            return Err(Error::Storage(format!(
                "checkpoint in {:?} belongs to {}, expected {}",
                dir,
                checkpoint.shard_id(),
                shard_id
            )));
        }

        let registry = FileRegistry::default();
        let mut files = BTreeMap::new();
        for meta in checkpoint.files().values() {
            let path = data_path(&dir, meta);
            let length = match fs::metadata(&path) {
                Ok(stat) => stat.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::FileNotFound {
                        shard: shard_id.to_string(),
                        file: meta.name().to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            if length != meta.length() {
                return Err(Error::LengthMismatch {
                    file: meta.name().to_string(),
                    expected: meta.length(),
                    actual: length,
                });
            }
            let file = Arc::new(SegmentFile::new(
                &shard_id,
                meta.clone(),
                path.clone(),
                cache.clone(),
                &registry,
            ));
            registry.lock().insert(path, Arc::downgrade(&file));
            files.insert(meta.name().to_string(), file);
        }

        let referenced: HashSet<&Path> = files.values().map(|f| f.path.as_path()).collect();
        let mut removed = 0usize;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file()
                && entry.file_name() != CHECKPOINT_FILE
                && !referenced.contains(path.as_path())
            {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} unreferenced files from {:?}", removed, dir);
        }

        info!(
            "Opened shard store {} at {:?} (term={}, gen={}, {} files)",
            shard_id,
            dir,
            checkpoint.primary_term(),
            checkpoint.segments_gen(),
            files.len()
        );

        Ok(Self {
            shard_id,
            dir,
            cache,
            current: RwLock::new(Arc::new(SegmentView { checkpoint, files })),
            files: registry,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pin the current view
    pub fn current_view(&self) -> Arc<SegmentView> {
        Arc::clone(&self.current.read())
    }

    /// Last committed checkpoint
    pub fn applied_checkpoint(&self) -> ReplicationCheckpoint {
        self.current.read().checkpoint.clone()
    }

    /// Metadata of every committed file
    pub fn metadata_snapshot(&self) -> MetadataSnapshot {
        self.current.read().metadata().clone()
    }

    /// Read a committed file from the current view
    pub async fn read_file(&self, name: &str) -> Result<SegmentHandle> {
        let view = self.current_view();
        view.read_file(name).await
    }

    /// Open a staging area. Its directory is removed when the area is
    /// dropped, committed or not.
    pub fn staging(&self, label: impl Into<String>) -> Result<StagingArea> {
        let label = label.into();
        validate_file_name(&label)?;
        let dir = self.dir.join(STAGING_DIR).join(&label);
        fs::create_dir_all(&dir)?;
        debug!("Opened staging area {:?} for {}", dir, self.shard_id);
        Ok(StagingArea {
            label,
            dir,
            completed: HashMap::new(),
        })
    }

    /// Atomically make `checkpoint` the shard's committed state.
    ///
    /// Every file of the checkpoint must either be identical to a file of
    /// the current view or have been completed in `staging`. The checkpoint
    /// must be strictly newer than the one already committed.
    pub fn commit(
        &self,
        staging: StagingArea,
        checkpoint: ReplicationCheckpoint,
    ) -> Result<Arc<SegmentView>> {
        let guard = self.commit_lock.lock();
        self.commit_locked(&guard, staging, checkpoint)
    }

    fn commit_locked(
        &self,
        _guard: &MutexGuard<'_, ()>,
        staging: StagingArea,
        checkpoint: ReplicationCheckpoint,
    ) -> Result<Arc<SegmentView>> {
        if checkpoint.shard_id() != &self.shard_id {
            return Err(Error::invalid_argument(format!(
                "checkpoint for {} committed to {}",
                checkpoint.shard_id(),
                self.shard_id
            )));
        }

        let current = self.current_view();
        if !checkpoint.is_ahead_of(current.checkpoint()) {
            return Err(Error::StaleCheckpoint {
                shard: self.shard_id.to_string(),
                received: format!("{:?}", checkpoint.version()),
                current: format!("{:?}", current.checkpoint().version()),
            });
        }

        let mut files = BTreeMap::new();
        let mut promoted = 0usize;
        for meta in checkpoint.files().values() {
            let retained = current
                .files
                .get(meta.name())
                .filter(|existing| existing.meta.is_same(meta));
            if let Some(existing) = retained {
                files.insert(meta.name().to_string(), Arc::clone(existing));
                continue;
            }

            if !staging.is_complete(meta) {
                return Err(Error::Storage(format!(
                    "file {} of checkpoint {} was neither retained nor staged",
                    meta, checkpoint
                )));
            }
            let file = self.promote(&staging, meta)?;
            files.insert(meta.name().to_string(), file);
            promoted += 1;
        }
        sync_dir(&self.dir)?;
        self.persist_checkpoint(&checkpoint)?;

        let view = Arc::new(SegmentView { checkpoint, files });
        let previous = std::mem::replace(&mut *self.current.write(), Arc::clone(&view));

        for file in view.files.values() {
            file.obsolete.store(false, Ordering::Release);
        }
        let live: HashSet<&Path> = view.files.values().map(|f| f.path.as_path()).collect();
        let mut superseded = 0usize;
        for file in previous.files.values() {
            if !live.contains(file.path.as_path()) {
                file.obsolete.store(true, Ordering::Release);
                superseded += 1;
            }
        }

        info!(
            "Committed {} (promoted {} files, retained {}, superseded {})",
            view.checkpoint,
            promoted,
            view.files.len() - promoted,
            superseded
        );
        drop(staging);
        Ok(view)
    }

    /// Move a staged file to its data path, or adopt the owner an older
    /// view still holds for the same name and contents
    fn promote(&self, staging: &StagingArea, meta: &StoreFileMetadata) -> Result<Arc<SegmentFile>> {
        let target = data_path(&self.dir, meta);
        let mut registry = self.files.lock();
        if let Some(owner) = registry.get(&target).and_then(Weak::upgrade) {
            debug!("Reusing {:?} still held by an older view", target);
            return Ok(owner);
        }
        fs::rename(staging.path_for(meta.name()), &target)?;
        let file = Arc::new(SegmentFile::new(
            &self.shard_id,
            meta.clone(),
            target.clone(),
            self.cache.clone(),
            &self.files,
        ));
        registry.insert(target, Arc::downgrade(&file));
        Ok(file)
    }

    /// Primary-side commit: add and remove files and produce the next
    /// checkpoint (`segments_gen + 1`).
    pub fn commit_segments(
        &self,
        primary_term: u64,
        add: Vec<(String, Bytes)>,
        remove: &[String],
    ) -> Result<ReplicationCheckpoint> {
        let guard = self.commit_lock.lock();
        let current = self.applied_checkpoint();
        if primary_term < current.primary_term() {
            return Err(Error::invalid_argument(format!(
                "primary term {} is behind committed term {}",
                primary_term,
                current.primary_term()
            )));
        }

        let next_gen = current.segments_gen() + 1;
        let mut files = current.files().clone();
        for name in remove {
            files.remove(name);
        }

        let mut staging = self.staging(format!("commit-{}", next_gen))?;
        for (name, data) in &add {
            validate_file_name(name)?;
            let meta = StoreFileMetadata::for_contents(name.clone(), data);
            staging.write_file(&meta, data)?;
            files.insert(name.clone(), meta);
        }

        let checkpoint = ReplicationCheckpoint::new(
            self.shard_id.clone(),
            primary_term,
            next_gen,
            files.into_values(),
        );
        self.commit_locked(&guard, staging, checkpoint.clone())?;
        Ok(checkpoint)
    }

    fn persist_checkpoint(&self, checkpoint: &ReplicationCheckpoint) -> Result<()> {
        let raw = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = self.dir.join(CHECKPOINT_TMP);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))?;
        sync_dir(&self.dir)
    }
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("shard_id", &self.shard_id)
            .field("dir", &self.dir)
            .finish()
    }
}

/// Scratch directory for files received by one attempt
pub struct StagingArea {
    label: String,
    dir: PathBuf,
    /// Files written and verified so far
    completed: HashMap<String, StoreFileMetadata>,
}

impl StagingArea {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if this exact file has already been written and verified
    pub fn is_complete(&self, meta: &StoreFileMetadata) -> bool {
        self.completed
            .get(meta.name())
            .is_some_and(|done| done.is_same(meta))
    }

    pub fn completed_files(&self) -> impl Iterator<Item = &StoreFileMetadata> {
        self.completed.values()
    }

    /// Start (or restart) writing a file
    pub fn create_file(&mut self, meta: &StoreFileMetadata) -> Result<StagedFileWriter> {
        validate_file_name(meta.name())?;
        self.completed.remove(meta.name());
        let path = self.path_for(meta.name());
        let file = File::create(&path)?;
        Ok(StagedFileWriter {
            meta: meta.clone(),
            path,
            out: BufWriter::new(file),
            calc: ChecksumCalculator::new(),
        })
    }

    /// Verify a fully written file and mark it complete
    pub fn finish_file(&mut self, writer: StagedFileWriter) -> Result<StoreFileMetadata> {
        let meta = writer.finish()?;
        self.completed.insert(meta.name().to_string(), meta.clone());
        Ok(meta)
    }

    /// Write a whole file in one go
    pub fn write_file(&mut self, meta: &StoreFileMetadata, data: &[u8]) -> Result<()> {
        let mut writer = self.create_file(meta)?;
        writer.write_chunk(0, data)?;
        self.finish_file(writer)?;
        Ok(())
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed staging area {:?}", self.dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging area {:?}: {}", self.dir, e),
        }
    }
}

/// Sequential writer for one staged file, checksumming as it goes
pub struct StagedFileWriter {
    meta: StoreFileMetadata,
    path: PathBuf,
    out: BufWriter<File>,
    calc: ChecksumCalculator,
}

impl StagedFileWriter {
    pub fn meta(&self) -> &StoreFileMetadata {
        &self.meta
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.calc.bytes()
    }

    /// Append a chunk. Chunks must arrive in order and may not run past the
    /// expected length.
    pub fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset != self.calc.bytes() {
            return Err(Error::protocol(format!(
                "out-of-order chunk for {}: offset {} but {} bytes written",
                self.meta.name(),
                offset,
                self.calc.bytes()
            )));
        }
        let end = offset + data.len() as u64;
        if end > self.meta.length() {
            return Err(Error::LengthMismatch {
                file: self.meta.name().to_string(),
                expected: self.meta.length(),
                actual: end,
            });
        }
        self.out.write_all(data)?;
        self.calc.update(data);
        Ok(())
    }

    /// Flush, fsync and verify length and checksum. A file that fails
    /// verification is deleted.
    pub fn finish(self) -> Result<StoreFileMetadata> {
        let Self {
            meta,
            path,
            out,
            calc,
        } = self;

        let file = out.into_inner().map_err(|e| Error::DiskIo(e.into_error()))?;
        file.sync_all()?;

        let written = calc.bytes();
        let verified = if written != meta.length() {
            Err(Error::LengthMismatch {
                file: meta.name().to_string(),
                expected: meta.length(),
                actual: written,
            })
        } else {
            let actual = calc.finalize();
            if actual == meta.checksum() {
                Ok(())
            } else {
                Err(Error::ChecksumMismatch {
                    file: meta.name().to_string(),
                    expected: meta.checksum().to_hex(),
                    actual: actual.to_hex(),
                })
            }
        };

        if let Err(e) = verified {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(meta)
    }
}
